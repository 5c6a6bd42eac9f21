use serde::Serialize;
use std::collections::BTreeMap;

/// User profile fields sent as `user_details`.
///
/// `picture` is a URL the collector downloads; `picture_path` names a local
/// file uploaded alongside the request instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(skip)]
    pub picture_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byear: Option<u16>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
}

impl UserProfile {
    pub fn is_empty(&self) -> bool {
        [
            &self.name,
            &self.username,
            &self.email,
            &self.organization,
            &self.phone,
            &self.picture,
            &self.picture_path,
            &self.gender,
        ]
        .iter()
        .all(|field| field.as_deref().map_or(true, str::is_empty))
            && self.byear.is_none()
            && self.custom.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_profile() {
        assert!(UserProfile::default().is_empty());
        let blank = UserProfile {
            email: Some(String::new()),
            ..Default::default()
        };
        assert!(blank.is_empty());
    }

    #[test]
    fn test_serialization_skips_absent_fields() {
        let profile = UserProfile {
            email: Some("ada@example.com".into()),
            byear: Some(1815),
            ..Default::default()
        };
        assert!(!profile.is_empty());
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"email": "ada@example.com", "byear": 1815})
        );
    }
}
