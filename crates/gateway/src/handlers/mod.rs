//! API handlers module

pub mod chats;
pub mod health;
pub mod items;
pub mod search;
pub mod storages;

use axum::{
    extract::{FromRequest, Request},
    Json,
};
use cevra_common::errors::{AppError, Result};
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use validator::Validate;

/// JSON body that is deserialized and then checked with `validator`.
/// Both failures surface as `AppError::Validation`.
pub struct ValidatedJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| AppError::Validation {
                message: rejection.body_text(),
                field: None,
            })?;

        value.validate()?;
        Ok(Self(value))
    }
}

/// Distinguishes an absent field (`None`) from an explicit `null`
/// (`Some(None)`) in partial updates
pub fn double_option<'de, T, D>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 500;

/// Checks shared by the storage and chat update bodies
pub fn validate_update(name: Option<&str>, description: &Option<Option<String>>) -> Result<()> {
    if let Some(name) = name {
        let len = name.chars().count();
        if name.trim().is_empty() || len > MAX_NAME_LEN {
            return Err(AppError::validation(
                "name",
                format!("name must be 1 to {} characters", MAX_NAME_LEN),
            ));
        }
    }

    if let Some(Some(description)) = description {
        if description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(AppError::validation(
                "description",
                format!("description must be at most {} characters", MAX_DESCRIPTION_LEN),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Deserialize)]
    struct Patch {
        #[serde(default, deserialize_with = "double_option")]
        description: Option<Option<String>>,
    }

    #[test]
    fn test_double_option_keeps_null_apart_from_missing() {
        let missing: Patch = serde_json::from_str("{}").unwrap();
        assert_eq!(missing.description, None);

        let cleared: Patch = serde_json::from_str(r#"{"description": null}"#).unwrap();
        assert_eq!(cleared.description, Some(None));

        let set: Patch = serde_json::from_str(r#"{"description": "x"}"#).unwrap();
        assert_eq!(set.description, Some(Some("x".to_string())));
    }

    #[test]
    fn test_validate_update_bounds() {
        assert_ok!(validate_update(Some("ok"), &None));
        assert_err!(validate_update(Some("   "), &None));
        assert_err!(validate_update(Some(&"n".repeat(101)), &None));
        assert_err!(validate_update(None, &Some(Some("d".repeat(501)))));
        assert_ok!(validate_update(None, &Some(None)));
    }
}
