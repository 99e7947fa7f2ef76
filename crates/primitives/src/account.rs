use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// On-chain account name.
///
/// Names are 1 to 13 characters from `a-z`, `1-5` and `.`, the encoding the
/// chain uses for its compact name representation.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "SmolStr", into = "SmolStr")]
pub struct AccountName(SmolStr);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid account name: {0:?}")]
pub struct InvalidAccountName(pub String);

impl AccountName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), InvalidAccountName> {
        let valid_len = !s.is_empty() && s.len() <= 13;
        let valid_chars =
            s.chars().all(|c| c.is_ascii_lowercase() || ('1'..='5').contains(&c) || c == '.');

        if valid_len && valid_chars {
            Ok(())
        } else {
            Err(InvalidAccountName(s.to_string()))
        }
    }
}

impl FromStr for AccountName {
    type Err = InvalidAccountName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::validate(s)?;
        Ok(Self(SmolStr::new(s)))
    }
}

impl TryFrom<SmolStr> for AccountName {
    type Error = InvalidAccountName;

    fn try_from(s: SmolStr) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<AccountName> for SmolStr {
    fn from(name: AccountName) -> Self {
        name.0
    }
}

impl AsRef<str> for AccountName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for AccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountName({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn accepts_chain_alphabet() {
        assert_matches!("alice".parse::<AccountName>(), Ok(_));
        assert_matches!("prod.11".parse::<AccountName>(), Ok(_));
        assert_matches!("a2345".parse::<AccountName>(), Ok(_));
    }

    #[test]
    fn rejects_invalid_names() {
        assert_matches!("".parse::<AccountName>(), Err(_));
        assert_matches!("Alice".parse::<AccountName>(), Err(_));
        assert_matches!("toolongaccountname".parse::<AccountName>(), Err(_));
        assert_matches!("acc-ount".parse::<AccountName>(), Err(_));
    }
}
