// End-to-end upload pipeline against a file-backed SQLite store

use statement_ledger::{
    AmountLayout, AppConfig, BatchStatus, Credentials, DateFormat, IngestService, LedgerError,
    RejectReason, SqliteStore, TransactionFilter,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const JANUARY: &str = "Date,Description,Amount\n\
                       2024-01-05,Coffee Shop,-4.50\n\
                       2024-01-05,Coffee Shop,-4.50\n\
                       2024-01-06,Salary,2000.00\n";

fn open(dir: &TempDir) -> IngestService {
    let store = SqliteStore::open(&dir.path().join("ledger.db"), Duration::from_secs(5)).unwrap();
    IngestService::new(Arc::new(store), &AppConfig::default())
}

fn login(service: &IngestService, username: &str) -> String {
    service
        .login(&Credentials::new(username, "correct horse"))
        .unwrap()
        .token
}

fn register(service: &IngestService, username: &str) {
    service
        .authenticator()
        .register_user(username, "correct horse")
        .unwrap();
}

#[test]
fn test_reupload_after_restart_is_all_duplicates() {
    let dir = tempfile::tempdir().unwrap();

    {
        let service = open(&dir);
        register(&service, "alice");
        let token = login(&service, "alice");
        let summary = service.upload(&token, "jan.csv", JANUARY.as_bytes(), None).unwrap();
        assert_eq!(summary.accepted, 3);
    }

    // Sessions are in memory; the ledger is not
    let service = open(&dir);
    let token = login(&service, "alice");
    let summary = service.upload(&token, "jan.csv", JANUARY.as_bytes(), None).unwrap();
    assert_eq!(summary.accepted, 0);
    assert_eq!(summary.duplicates, 3);

    let txs = service.list_transactions(&token, &TransactionFilter::default()).unwrap();
    let occurrences: Vec<u32> = txs.iter().map(|t| t.occurrence).collect();
    assert_eq!(occurrences, vec![0, 1, 0]);

    let uploads = service.list_uploads(&token).unwrap();
    assert_eq!(uploads.len(), 2);
    assert!(uploads.iter().all(|b| b.status == BatchStatus::Completed));
}

#[test]
fn test_overlapping_statements_from_different_banks_formats() {
    let dir = tempfile::tempdir().unwrap();
    let service = open(&dir);
    register(&service, "alice");
    let token = login(&service, "alice");

    // Same two transactions, exported once as ISO/signed and once as
    // US dates with split debit/credit columns
    let export_a = "Date,Description,Amount\n\
                    2024-01-05,Coffee Shop,-4.50\n\
                    2024-01-06,Salary,2000.00\n";
    let export_b = "Posted Date,Payee,Debit,Credit\n\
                    01/05/2024,COFFEE SHOP,4.50,\n\
                    01/06/2024,Salary,,2000.00\n\
                    01/07/2024,Rent,900.00,\n";

    service.upload(&token, "a.csv", export_a.as_bytes(), None).unwrap();
    let summary = service.upload(&token, "b.csv", export_b.as_bytes(), None).unwrap();

    assert_eq!(summary.duplicates, 2);
    assert_eq!(summary.accepted, 1);

    let rent = service
        .list_transactions(
            &token,
            &TransactionFilter {
                max_amount: Some(-50000),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(rent.len(), 1);
    assert_eq!(rent[0].amount, -90000);
    assert_eq!(rent[0].source_upload_id, summary.upload_id);
}

#[test]
fn test_european_export_with_bad_rows() {
    let dir = tempfile::tempdir().unwrap();
    let service = open(&dir);
    register(&service, "bob");
    let token = login(&service, "bob");

    let mut export = String::from("Booking Date;Narrative;Amount\n");
    export.push_str("01.01.2024;Kaffee;-4,50\n");
    export.push_str("31.02.2024;Broken date;-1,00\n");
    for day in 2..=9 {
        export.push_str(&format!("{:02}.01.2024;Eintrag {};-{},25\n", day, day, day));
    }
    export.push_str("10.01.2024;Gehalt;1.234,56\n");
    export.push_str("11.01.2024;;-3,00\n");

    let dialect = service.detect(export.as_bytes(), None).unwrap();
    assert_eq!(dialect.delimiter, ';');
    assert_eq!(dialect.date_format, DateFormat::DayMonthYearDots);
    assert_eq!(dialect.amount_layout, AmountLayout::Signed);

    let summary = service.upload(&token, "konto.csv", export.as_bytes(), None).unwrap();
    assert_eq!(summary.accepted, 10);
    assert_eq!(summary.rejected.len(), 2);
    assert_eq!(summary.rejected[0].line, 3);
    assert!(matches!(summary.rejected[0].reason, RejectReason::InvalidDate(_)));
    assert_eq!(summary.rejected[1].line, 13);
    assert_eq!(summary.rejected[1].reason, RejectReason::EmptyDescription);

    let batch = &service.list_uploads(&token).unwrap()[0];
    assert_eq!(batch.row_count, 12);
    assert_eq!(batch.rejected_count, 2);

    let txs = service.list_transactions(&token, &TransactionFilter::default()).unwrap();
    assert_eq!(txs.first().map(|t| t.amount), Some(-450));
    assert_eq!(txs.last().map(|t| t.amount), Some(123456));
}

#[test]
fn test_users_never_see_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let service = open(&dir);
    register(&service, "alice");
    register(&service, "bob");
    let alice = login(&service, "alice");
    let bob = login(&service, "bob");

    service.upload(&alice, "jan.csv", JANUARY.as_bytes(), None).unwrap();
    let bob_summary = service.upload(&bob, "jan.csv", JANUARY.as_bytes(), None).unwrap();

    // Identical content, different owner: nothing is a duplicate
    assert_eq!(bob_summary.accepted, 3);
    assert_eq!(service.list_transactions(&alice, &TransactionFilter::default()).unwrap().len(), 3);
    assert_eq!(service.list_uploads(&bob).unwrap().len(), 1);
}

#[test]
fn test_auth_failures_persist_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let service = open(&dir);
    register(&service, "alice");

    assert!(matches!(
        service.login(&Credentials::new("alice", "wrong")),
        Err(LedgerError::InvalidCredentials)
    ));

    let token = login(&service, "alice");
    service.logout(&token);
    let err = service.upload(&token, "jan.csv", JANUARY.as_bytes(), None).unwrap_err();
    assert!(err.is_auth());

    let fresh = login(&service, "alice");
    assert!(service.list_transactions(&fresh, &TransactionFilter::default()).unwrap().is_empty());
    assert!(service.list_uploads(&fresh).unwrap().is_empty());
}

#[test]
fn test_unrecognized_upload_records_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let service = open(&dir);
    register(&service, "alice");
    let token = login(&service, "alice");

    let err = service
        .upload(&token, "notes.csv", b"a,b,c\nfoo,bar,baz\n", None)
        .unwrap_err();
    assert!(matches!(err, LedgerError::UnrecognizedFormat(_)));
    assert!(service.list_uploads(&token).unwrap().is_empty());
}
