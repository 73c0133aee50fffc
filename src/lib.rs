//! # Wikigate (Wiki Access Control)
//!
//! `wikigate` decides who may sign in to a multi-tenant wiki console, throttles
//! brute-force login attempts, organizes users into hierarchical permission
//! groups and correlates third-party (OAuth) logins across the redirect
//! round-trip.
//!
//! ## Login throttling
//!
//! Failed logins are counted per source IP in a shared keyed store using atomic
//! increment-with-expiry. Once the threshold is reached the IP is locked out for
//! a fixed duration; a successful login clears the counters through a bounded
//! background worker so the response is never delayed.
//!
//! ## Auth groups
//!
//! Groups belong to one knowledge base and may name a parent. Display paths
//! (`/Root/Child/Leaf`) are derived on read by walking the parent chain with a
//! depth bound and a visited set, so operator-introduced cycles never hang a
//! request.
//!
//! ## OAuth
//!
//! State tokens are random, single-use and expire after 15 minutes. Redirect
//! targets are checked against the tenant's base URL or host allow-list both
//! when the state is issued and when it is redeemed.

pub mod api;
pub mod auths;
pub mod cli;
pub mod groups;
pub mod oauth;
pub mod ratelimit;
pub mod session;
pub mod store;
pub mod tenants;
pub mod tls;
pub mod token;
pub mod users;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
