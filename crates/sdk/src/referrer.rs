//! Install referrer attribution.
//!
//! The platform hands over a raw referrer string such as
//! `utm_source=x&countly_cid=abc&countly_cuid=u1`, sometimes URL-encoded a
//! second time. It is stored until the next activity start sends it.

use pulse_core::PulseResult;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::form_urlencoded;

use crate::store::{keys, KeyValueStore};

const CAMPAIGN_ID_PARAM: &str = "countly_cid";
const CAMPAIGN_USER_PARAM: &str = "countly_cuid";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReferrer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_user: Option<String>,
}

impl InstallReferrer {
    /// Extracts the campaign fields; `None` when the referrer carries no
    /// campaign id.
    pub fn parse(raw: &str) -> Option<Self> {
        let decoded = if raw.contains('=') {
            raw.to_string()
        } else {
            form_urlencoded::parse(format!("r={raw}").as_bytes())
                .next()
                .map(|(_, value)| value.into_owned())
                .unwrap_or_default()
        };

        let mut referrer = Self::default();
        for (key, value) in form_urlencoded::parse(decoded.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                CAMPAIGN_ID_PARAM => referrer.campaign_id = Some(value.into_owned()),
                CAMPAIGN_USER_PARAM => referrer.campaign_user = Some(value.into_owned()),
                _ => {}
            }
        }
        referrer.campaign_id.is_some().then_some(referrer)
    }

    pub fn persist(&self, store: &dyn KeyValueStore) -> PulseResult<()> {
        debug!(campaign_id = ?self.campaign_id, "install referrer stored");
        store.put(keys::INSTALL_REFERRER, &serde_json::to_string(self)?)
    }

    pub fn load(store: &dyn KeyValueStore) -> PulseResult<Option<Self>> {
        match store.get(keys::INSTALL_REFERRER)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn delete(store: &dyn KeyValueStore) -> PulseResult<()> {
        store.remove(keys::INSTALL_REFERRER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_parse_plain() {
        let referrer =
            InstallReferrer::parse("utm_source=ads&countly_cid=abc&countly_cuid=u1").unwrap();
        assert_eq!(referrer.campaign_id.as_deref(), Some("abc"));
        assert_eq!(referrer.campaign_user.as_deref(), Some("u1"));
    }

    #[test]
    fn test_parse_encoded() {
        let referrer = InstallReferrer::parse("countly_cid%3Dabc%26utm_medium%3Dcpc").unwrap();
        assert_eq!(referrer.campaign_id.as_deref(), Some("abc"));
        assert_eq!(referrer.campaign_user, None);
    }

    #[test]
    fn test_parse_without_campaign() {
        assert_eq!(InstallReferrer::parse("utm_source=ads"), None);
        assert_eq!(InstallReferrer::parse(""), None);
    }

    #[test]
    fn test_persist_load_delete() {
        let store = MemoryStore::new();
        assert_eq!(InstallReferrer::load(&store).unwrap(), None);
        let referrer = InstallReferrer::parse("countly_cid=abc").unwrap();
        referrer.persist(&store).unwrap();
        assert_eq!(InstallReferrer::load(&store).unwrap(), Some(referrer));
        InstallReferrer::delete(&store).unwrap();
        assert_eq!(InstallReferrer::load(&store).unwrap(), None);
    }
}
