use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named opaque key/value bag for one provider. Credentials are shared
/// across clusters and outlive them.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Credential {
    pub name: String,

    pub provider: String,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// Field-presence schema a provider declares for its credentials.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CredentialSchema {
    pub provider: &'static str,
    pub required_fields: &'static [&'static str],
}

impl CredentialSchema {
    /// Checks provider match and field presence; returns the offending
    /// field on mismatch.
    pub fn validate(&self, credential: &Credential) -> Result<(), String> {
        if credential.provider != self.provider {
            return Err(format!(
                "credential `{}` is for provider {}, not {}",
                credential.name, credential.provider, self.provider
            ));
        }
        for field in self.required_fields {
            match credential.data.get(*field) {
                Some(v) if !v.is_empty() => {}
                _ => return Err(format!("missing required field `{field}`")),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: CredentialSchema = CredentialSchema {
        provider: "digitalocean",
        required_fields: &["token"],
    };

    fn credential(data: &[(&str, &str)]) -> Credential {
        Credential {
            name: "do-cred".into(),
            provider: "digitalocean".into(),
            data: data
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_complete_credentials() {
        assert!(SCHEMA.validate(&credential(&[("token", "abc123")])).is_ok());
    }

    #[test]
    fn names_the_offending_field() {
        let err = SCHEMA.validate(&credential(&[("token", "")])).unwrap_err();
        assert!(err.contains("token"), "{err}");
    }

    #[test]
    fn rejects_wrong_provider() {
        let mut cred = credential(&[("token", "abc")]);
        cred.provider = "gce".into();
        assert!(SCHEMA.validate(&cred).is_err());
    }
}
