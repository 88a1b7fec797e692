// Copyright 2023 宋昊文
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

extern crate cookie;
extern crate url;

use std::convert::TryInto;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use url::Url;

use crate::internet::header::{Header, HeaderSearch};

/// Storage for cookies across requests.
pub trait CookieStore: Send + Sync {
    /// Stores the `Set-Cookie` headers of a response from `url`.
    fn set_cookies(&self, url: &Url, headers: &[Header]);

    /// `Cookie` header value to send to `url`, if any.
    fn cookies(&self, url: &Url) -> Option<String>;
}

struct StoredCookie {
    name: String,
    value: String,
    domain: String,
    host_only: bool,
    path: String,
    secure: bool,
    expires: Option<SystemTime>,
}

impl StoredCookie {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires.map_or(false, |t| t <= now)
    }

    fn matches(&self, host: &str, path: &str, secure: bool) -> bool {
        if self.secure && !secure {
            return false;
        }

        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_match(host, &self.domain)
        };

        domain_ok && path_match(path, &self.path)
    }
}

fn domain_match(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

fn path_match(request_path: &str, cookie_path: &str) -> bool {
    request_path == cookie_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/')
                || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/')))
}

fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(0) | None => String::from("/"),
        Some(i) => String::from(&request_path[..i]),
    }
}

/// In-memory cookie jar with domain, path, secure and expiry matching.
pub struct Jar {
    cookies: Mutex<Vec<StoredCookie>>,
}

impl Jar {
    pub fn new() -> Jar {
        Jar {
            cookies: Mutex::new(Vec::new()),
        }
    }

    pub fn add_cookie_str(&self, cookie: &str, url: &Url) {
        let parsed = match cookie::Cookie::parse(cookie.to_owned()) {
            Ok(parsed) => parsed,
            Err(_) => return,
        };

        let host = match url.host_str() {
            Some(host) => host.to_ascii_lowercase(),
            None => return,
        };

        let (domain, host_only) = match parsed.domain() {
            Some(domain) if !domain.trim_start_matches('.').is_empty() => {
                let domain = domain.trim_start_matches('.').to_ascii_lowercase();
                if !domain_match(&host, &domain) {
                    return;
                }
                (domain, false)
            }
            _ => (host, true),
        };

        let path = match parsed.path() {
            Some(path) if path.starts_with('/') => String::from(path),
            _ => default_path(url.path()),
        };

        let now = SystemTime::now();
        let expires = match parsed.max_age() {
            Some(max_age) => {
                let max_age: Option<Duration> = max_age.try_into().ok();
                match max_age {
                    Some(d) if !d.is_zero() => Some(now + d),
                    _ => Some(now),
                }
            }
            None => parsed.expires_datetime().map(SystemTime::from),
        };

        let stored = StoredCookie {
            name: String::from(parsed.name()),
            value: String::from(parsed.value()),
            domain,
            host_only,
            path,
            secure: parsed.secure().unwrap_or(false),
            expires,
        };

        let mut cookies = self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        cookies.retain(|c| {
            !(c.name == stored.name && c.domain == stored.domain && c.path == stored.path)
                && !c.is_expired(now)
        });
        if !stored.is_expired(now) {
            cookies.push(stored);
        }
    }

    pub fn len(&self) -> usize {
        self.cookies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Jar {
    fn default() -> Jar {
        Jar::new()
    }
}

impl CookieStore for Jar {
    fn set_cookies(&self, url: &Url, headers: &[Header]) {
        for h in HeaderSearch::new(headers, b"Set-Cookie", true) {
            if let Some(value) = h.value_str() {
                self.add_cookie_str(value, url);
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?.to_ascii_lowercase();
        let secure = url.scheme() == "https";
        let now = SystemTime::now();

        let cookies = self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<&StoredCookie> = cookies
            .iter()
            .filter(|c| !c.is_expired(now) && c.matches(&host, url.path(), secure))
            .collect();

        if matched.is_empty() {
            return None;
        }

        matched.sort_by(|a, b| b.path.len().cmp(&a.path.len()));

        Some(
            matched
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<String>>()
                .join("; "),
        )
    }
}
