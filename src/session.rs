//! Browser session identity carried in the `session` cookie.

use crate::error::{Error, Result};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use std::time::{SystemTime, UNIX_EPOCH};

pub const COOKIE: &str = "session";

fn generate() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("{secs}-{}", uuid::Uuid::new_v4().simple())
}

/// Session id from the cookie, issuing a new one when absent.
pub fn get_or_create(jar: CookieJar) -> (CookieJar, String) {
    if let Some(id) = jar.get(COOKIE).map(|c| c.value().to_string()) {
        return (jar, id);
    }
    let id = generate();
    let cookie = Cookie::build((COOKIE, id.clone())).path("/").http_only(true);
    (jar.add(cookie), id)
}

pub fn require(jar: &CookieJar) -> Result<String> {
    jar.get(COOKIE)
        .map(|c| c.value().to_string())
        .filter(|id| !id.is_empty())
        .ok_or(Error::NoSession)
}
