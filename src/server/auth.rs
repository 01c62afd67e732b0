//! Authenticated-subject extractors.
//!
//! Identity is established by the fronting session middleware, which is an
//! external collaborator: it injects `x-auth-subject` (an opaque subject
//! id) and `x-auth-role` (`admin` or `user`) on every authenticated
//! request. This module only consumes those headers.

use std::str::FromStr;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use super::api::error::Error;

/// Header carrying the opaque subject id.
pub const SUBJECT_HEADER: &str = "x-auth-subject";

/// Header carrying the subject's role.
pub const ROLE_HEADER: &str = "x-auth-role";

/// A subject's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A regular platform user.
    User,
    /// A platform administrator.
    Admin,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            _ => Err(format!("invalid role: {}", s)),
        }
    }
}

/// The authenticated subject of a request.
#[derive(Debug, Clone)]
pub struct Subject {
    /// The opaque subject id.
    pub id: String,
    /// The subject's role.
    pub role: Role,
}

impl<S> FromRequestParts<S> for Subject
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(SUBJECT_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Unauthorized(String::from("authentication required")))?
            .to_string();

        let role = parts
            .headers
            .get(ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Unauthorized(String::from("authentication required")))?;

        Ok(Subject { id, role })
    }
}

/// An authenticated subject that must hold the `admin` role.
#[derive(Debug, Clone)]
pub struct Admin(pub Subject);

impl<S> FromRequestParts<S> for Admin
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let subject = Subject::from_request_parts(parts, state).await?;

        if subject.role != Role::Admin {
            return Err(Error::Forbidden(String::from(
                "administrator role required",
            )));
        }

        Ok(Admin(subject))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request;

    use super::*;

    /// Builds request parts with the given auth headers.
    fn parts(subject: Option<&str>, role: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/");
        if let Some(subject) = subject {
            builder = builder.header(SUBJECT_HEADER, subject);
        }
        if let Some(role) = role {
            builder = builder.header(ROLE_HEADER, role);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn missing_headers_are_unauthorized() {
        let mut p = parts(None, None);
        assert!(Subject::from_request_parts(&mut p, &()).await.is_err());

        let mut p = parts(Some("user-1"), None);
        assert!(Subject::from_request_parts(&mut p, &()).await.is_err());

        let mut p = parts(Some("user-1"), Some("superuser"));
        assert!(Subject::from_request_parts(&mut p, &()).await.is_err());
    }

    #[tokio::test]
    async fn subject_extraction_succeeds() {
        let mut p = parts(Some("user-1"), Some("user"));
        let subject = Subject::from_request_parts(&mut p, &()).await.unwrap();
        assert_eq!(subject.id, "user-1");
        assert_eq!(subject.role, Role::User);
    }

    #[tokio::test]
    async fn admin_extractor_enforces_role() {
        let mut p = parts(Some("user-1"), Some("user"));
        assert!(Admin::from_request_parts(&mut p, &()).await.is_err());

        let mut p = parts(Some("root"), Some("admin"));
        let admin = Admin::from_request_parts(&mut p, &()).await.unwrap();
        assert_eq!(admin.0.id, "root");
        assert_eq!(admin.0.role, Role::Admin);
    }
}
