use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use fundflow_core::{AccountId, DomainError, DomainResult};

/// Account reference data. Owned by the API layer; read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub account_id: AccountId,
    /// IANA zone name, e.g. `America/Chicago`.
    pub timezone: String,
}

impl Account {
    pub fn new(account_id: AccountId, timezone: impl Into<String>) -> Self {
        Self {
            account_id,
            timezone: timezone.into(),
        }
    }

    pub fn timezone(&self) -> DomainResult<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| DomainError::invalid_timezone(self.timezone.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_iana_zone() {
        let account = Account::new(AccountId::new(1), "America/Chicago");
        assert_eq!(account.timezone().unwrap(), Tz::America__Chicago);
    }

    #[test]
    fn unknown_zone_is_an_error() {
        let account = Account::new(AccountId::new(1), "Mars/Olympus_Mons");
        assert_eq!(
            account.timezone().unwrap_err(),
            DomainError::InvalidTimezone("Mars/Olympus_Mons".into())
        );
    }
}
