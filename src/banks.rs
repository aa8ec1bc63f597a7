// 🏦 Bank profiles - resolve a client-declared bank hint
//
// "Chase", "chase bank", "JPMorgan Chase" → same profile. A profile only
// carries the conventions detection cannot always infer on its own: which
// amount layout to prefer and which date order to prefer.

use crate::dialect::{AmountLayout, DateFormat};
use serde::{Deserialize, Serialize};

// ============================================================================
// BANK PROFILE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankProfile {
    /// Canonical name (the "official" name we use)
    pub canonical_name: String,

    /// Alternative names that map to this profile
    pub aliases: Vec<String>,

    /// Preferred amount representation when both look plausible
    pub amount_layout: Option<AmountLayout>,

    /// Preferred date pattern when several satisfy the threshold
    pub date_format: Option<DateFormat>,
}

impl BankProfile {
    pub fn new(canonical_name: &str) -> Self {
        BankProfile {
            canonical_name: canonical_name.to_string(),
            aliases: Vec::new(),
            amount_layout: None,
            date_format: None,
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        if !self.aliases.iter().any(|a| a == alias) && alias != self.canonical_name {
            self.aliases.push(alias.to_string());
        }
        self
    }

    pub fn with_layout(mut self, layout: AmountLayout) -> Self {
        self.amount_layout = Some(layout);
        self
    }

    pub fn with_date_format(mut self, format: DateFormat) -> Self {
        self.date_format = Some(format);
        self
    }

    /// Check if a hint names this profile (canonical name or any alias)
    pub fn matches(&self, hint: &str) -> bool {
        let hint = normalize_name(hint);
        if hint.is_empty() {
            return false;
        }

        std::iter::once(&self.canonical_name)
            .chain(self.aliases.iter())
            .any(|name| normalize_name(name) == hint)
    }
}

fn normalize_name(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

// ============================================================================
// BANK REGISTRY
// ============================================================================

/// Registry of known bank export conventions
#[derive(Debug, Clone)]
pub struct BankRegistry {
    profiles: Vec<BankProfile>,
}

impl BankRegistry {
    /// Create new registry with default profiles
    pub fn new() -> Self {
        let mut registry = BankRegistry {
            profiles: Vec::new(),
        };

        registry.register_default_profiles();
        registry
    }

    pub fn empty() -> Self {
        BankRegistry {
            profiles: Vec::new(),
        }
    }

    fn register_default_profiles(&mut self) {
        self.register(
            BankProfile::new("Chase")
                .with_alias("JPMorgan Chase")
                .with_alias("Chase Bank")
                .with_layout(AmountLayout::Signed)
                .with_date_format(DateFormat::MonthDayYear),
        );

        self.register(
            BankProfile::new("Bank of America")
                .with_alias("BofA")
                .with_alias("BoA")
                .with_layout(AmountLayout::Signed)
                .with_date_format(DateFormat::MonthDayYear),
        );

        self.register(
            BankProfile::new("American Express")
                .with_alias("Amex")
                .with_layout(AmountLayout::Signed)
                .with_date_format(DateFormat::MonthDayYear),
        );

        self.register(
            BankProfile::new("Wells Fargo")
                .with_alias("WF")
                .with_layout(AmountLayout::Signed)
                .with_date_format(DateFormat::MonthDayYear),
        );

        self.register(
            BankProfile::new("Capital One")
                .with_alias("CapOne")
                .with_layout(AmountLayout::Split)
                .with_date_format(DateFormat::IsoDate),
        );

        self.register(
            BankProfile::new("Barclays")
                .with_layout(AmountLayout::Split)
                .with_date_format(DateFormat::DayMonthYear),
        );

        self.register(
            BankProfile::new("Monzo")
                .with_layout(AmountLayout::Signed)
                .with_date_format(DateFormat::DayMonthYear),
        );

        self.register(
            BankProfile::new("Deutsche Bank")
                .with_alias("DB")
                .with_layout(AmountLayout::Split)
                .with_date_format(DateFormat::DayMonthYearDots),
        );
    }

    pub fn register(&mut self, profile: BankProfile) {
        self.profiles.push(profile);
    }

    /// Find profile by hint (case-insensitive, punctuation ignored)
    pub fn find_by_hint(&self, hint: &str) -> Option<&BankProfile> {
        self.profiles.iter().find(|p| p.matches(hint))
    }

    pub fn all_profiles(&self) -> &[BankProfile] {
        &self.profiles
    }

    pub fn count(&self) -> usize {
        self.profiles.len()
    }
}

impl Default for BankRegistry {
    fn default() -> Self {
        Self::new()
    }
}
