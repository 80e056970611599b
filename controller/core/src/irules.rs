//! iRules and internal data groups used for TLS passthrough and re-encrypt
//! routing and for HTTP redirects.

use serde::{Deserialize, Serialize};

pub const HTTP_REDIRECT_IRULE_NAME: &str = "http_redirect_irule";
pub const SSL_PASSTHROUGH_IRULE_NAME: &str = "openshift_passthrough_irule";
pub const PASSTHROUGH_HOSTS_DG_NAME: &str = "ssl_passthrough_servername_dg";
pub const REENCRYPT_HOSTS_DG_NAME: &str = "ssl_reencrypt_servername_dg";

/// A load-balancer object name scoped to an administrative partition.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameRef {
    pub name: String,
    pub partition: String,
}

impl NameRef {
    pub fn new(name: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition: partition.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IRule {
    pub name: String,
    pub partition: String,
    pub code: String,
}

impl IRule {
    pub fn new(
        name: impl Into<String>,
        partition: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            partition: partition.into(),
            code: code.into(),
        }
    }
}

/// One `key -> value` entry of a data group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataGroupRecord {
    pub name: String,
    pub data: String,
}

/// A named key/value table; records are kept sorted by name so equality is
/// set equality.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalDataGroup {
    pub name: String,
    pub partition: String,
    pub records: Vec<DataGroupRecord>,
}

impl InternalDataGroup {
    pub fn new(name: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition: partition.into(),
            records: Vec::new(),
        }
    }

    /// Returns true if the group changed.
    pub fn add_or_update_record(&mut self, name: &str, data: &str) -> bool {
        match self.records.binary_search_by(|r| r.name.as_str().cmp(name)) {
            Ok(idx) => {
                if self.records[idx].data == data {
                    false
                } else {
                    self.records[idx].data = data.to_string();
                    true
                }
            }
            Err(idx) => {
                self.records.insert(
                    idx,
                    DataGroupRecord {
                        name: name.to_string(),
                        data: data.to_string(),
                    },
                );
                true
            }
        }
    }

    pub fn remove_record(&mut self, name: &str) -> bool {
        match self.records.binary_search_by(|r| r.name.as_str().cmp(name)) {
            Ok(idx) => {
                self.records.remove(idx);
                true
            }
            Err(_) => false,
        }
    }
}

/// Redirects plain HTTP requests to the TLS port.
pub fn http_redirect_irule(port: i32) -> String {
    format!(
        r#"when HTTP_REQUEST {{
    HTTP::redirect https://[getfield [HTTP::host] ":" 1]:{port}[HTTP::uri]
}}"#
    )
}

/// Routes TLS connections by SNI using the passthrough and re-encrypt
/// data groups.
pub fn ssl_passthrough_irule() -> String {
    format!(
        r#"when CLIENTSSL_HANDSHAKE {{
    SSL::collect
}}
when CLIENTSSL_DATA {{
    set servername_lower [string tolower [SSL::extensions -type 0]]
    if {{ [class match $servername_lower equals {passthrough}] }} {{
        pool [class match -value $servername_lower equals {passthrough}]
        SSL::disable serverside
    }} elseif {{ [class match $servername_lower equals {reencrypt}] }} {{
        pool [class match -value $servername_lower equals {reencrypt}]
    }}
    SSL::release
}}"#,
        passthrough = PASSTHROUGH_HOSTS_DG_NAME,
        reencrypt = REENCRYPT_HOSTS_DG_NAME,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_sorted_and_updated_in_place() {
        let mut dg = InternalDataGroup::new(PASSTHROUGH_HOSTS_DG_NAME, "velcro");
        assert!(dg.add_or_update_record("b.example", "/velcro/pool-b"));
        assert!(dg.add_or_update_record("a.example", "/velcro/pool-a"));
        assert!(!dg.add_or_update_record("a.example", "/velcro/pool-a"));
        assert!(dg.add_or_update_record("a.example", "/velcro/pool-a2"));
        assert_eq!(
            dg.records.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["a.example", "b.example"]
        );
        assert!(dg.remove_record("b.example"));
        assert!(!dg.remove_record("b.example"));
    }

    #[test]
    fn redirect_irule_carries_port() {
        assert!(http_redirect_irule(8443).contains(":8443"));
    }
}
