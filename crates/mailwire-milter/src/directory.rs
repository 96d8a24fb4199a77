//! Distribution-list directory collaborators.
//!
//! The dispatcher asks two questions: is this recipient a group, and may this
//! sender post to it. [`StaticDirectory`] answers both from configuration;
//! [`CachedDirectory`] memoizes any directory until told to forget.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::Deserialize;
use tracing::{debug, info};

use crate::Result;

/// A distribution list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Group {
    /// List address.
    pub mail: String,
    /// Display name.
    #[serde(default)]
    pub display_name: String,
    /// Use the reply-to override below instead of the list itself.
    #[serde(default)]
    pub reply_to_enabled: bool,
    /// Reply-to address override; blank means the list address.
    #[serde(default)]
    pub reply_to_address: String,
    /// Reply-to display name override; blank means the list display name.
    #[serde(default)]
    pub reply_to_display: String,
}

impl Group {
    /// Creates a group with only an address.
    #[must_use]
    pub fn new(mail: impl Into<String>) -> Self {
        Self {
            mail: mail.into(),
            display_name: String::new(),
            reply_to_enabled: false,
            reply_to_address: String::new(),
            reply_to_display: String::new(),
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Enables a reply-to override.
    #[must_use]
    pub fn with_reply_to(mut self, address: impl Into<String>, display: impl Into<String>) -> Self {
        self.reply_to_enabled = true;
        self.reply_to_address = address.into();
        self.reply_to_display = display.into();
        self
    }

    /// Returns the `Reply-To` mailbox for messages to this group.
    #[must_use]
    pub fn reply_to(&self) -> String {
        let (address, display) = if self.reply_to_enabled {
            (
                non_blank(&self.reply_to_address).unwrap_or(&self.mail),
                non_blank(&self.reply_to_display).unwrap_or(&self.display_name),
            )
        } else {
            (self.mail.as_str(), self.display_name.as_str())
        };
        format_mailbox(display, address)
    }
}

fn non_blank(s: &str) -> Option<&str> {
    (!s.trim().is_empty()).then_some(s)
}

/// Formats `display <address>`, quoting the display name when needed.
#[must_use]
pub fn format_mailbox(display: &str, address: &str) -> String {
    let display = display.trim();
    if display.is_empty() {
        return address.to_string();
    }
    if display.chars().any(|c| "()<>@,;:\\\".[]".contains(c)) {
        let escaped = display.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\" <{address}>")
    } else {
        format!("{display} <{address}>")
    }
}

/// Resolves recipient addresses to groups.
pub trait GroupResolver: Send + Sync {
    /// Returns the group for a normalized address, or `None` if the address
    /// is not a group.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be queried.
    fn resolve_group(&self, address: &str) -> Result<Option<Group>>;
}

/// Decides who may post to a group.
pub trait AccessPolicy: Send + Sync {
    /// Returns true if `sender` may send to `group`.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy cannot be evaluated.
    fn can_send_to_group(&self, sender: &str, group: &Group) -> Result<bool>;
}

/// A directory answering both questions.
pub trait Directory: GroupResolver + AccessPolicy {}

impl<T: GroupResolver + AccessPolicy> Directory for T {}

/// A group with its posting policy, as configured.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupEntry {
    /// The group.
    #[serde(flatten)]
    pub group: Group,
    /// Senders allowed to post: full addresses or `*@domain`. Empty means anyone.
    #[serde(default)]
    pub allowed_senders: Vec<String>,
}

/// In-memory directory.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    groups: HashMap<String, GroupEntry>,
}

impl StaticDirectory {
    /// Creates a directory from configured entries.
    #[must_use]
    pub fn new(entries: impl IntoIterator<Item = GroupEntry>) -> Self {
        let groups = entries
            .into_iter()
            .map(|entry| (entry.group.mail.to_lowercase(), entry))
            .collect();
        Self { groups }
    }

    /// Returns the number of groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Returns true if there are no groups.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl GroupResolver for StaticDirectory {
    fn resolve_group(&self, address: &str) -> Result<Option<Group>> {
        Ok(self
            .groups
            .get(&address.to_lowercase())
            .map(|entry| entry.group.clone()))
    }
}

impl AccessPolicy for StaticDirectory {
    fn can_send_to_group(&self, sender: &str, group: &Group) -> Result<bool> {
        let Some(entry) = self.groups.get(&group.mail.to_lowercase()) else {
            return Ok(true);
        };
        if entry.allowed_senders.is_empty() {
            return Ok(true);
        }
        let sender = sender.to_lowercase();
        let domain = sender.rsplit_once('@').map(|(_, d)| d);
        Ok(entry.allowed_senders.iter().any(|allowed| {
            let allowed = allowed.to_lowercase();
            match allowed.strip_prefix("*@") {
                Some(d) => domain == Some(d),
                None => allowed == sender,
            }
        }))
    }
}

/// Memoizing wrapper around another directory.
///
/// Lookups are cached without expiry; [`invalidate`](Self::invalidate) is the
/// only way to drop stale answers.
#[derive(Debug)]
pub struct CachedDirectory<D> {
    inner: D,
    groups: Mutex<HashMap<String, Option<Group>>>,
    permissions: Mutex<HashMap<(String, String), bool>>,
}

impl<D> CachedDirectory<D> {
    /// Wraps a directory.
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            groups: Mutex::new(HashMap::new()),
            permissions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the wrapped directory.
    pub const fn inner(&self) -> &D {
        &self.inner
    }

    /// Drops every cached answer and returns how many there were.
    pub fn invalidate(&self) -> usize {
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        let mut permissions = self
            .permissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let dropped = groups.len() + permissions.len();
        groups.clear();
        permissions.clear();
        info!(entries = dropped, "directory cache flushed");
        dropped
    }

    /// Returns the number of cached answers.
    pub fn cached(&self) -> usize {
        let groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner).len();
        let permissions = self
            .permissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        groups + permissions
    }
}

impl<D: GroupResolver> GroupResolver for CachedDirectory<D> {
    fn resolve_group(&self, address: &str) -> Result<Option<Group>> {
        let key = address.to_lowercase();
        if let Some(hit) = self
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(hit.clone());
        }
        // Errors are not cached.
        let group = self.inner.resolve_group(address)?;
        debug!(address, group = group.is_some(), "group lookup cached");
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, group.clone());
        Ok(group)
    }
}

impl<D: AccessPolicy> AccessPolicy for CachedDirectory<D> {
    fn can_send_to_group(&self, sender: &str, group: &Group) -> Result<bool> {
        let key = (sender.to_lowercase(), group.mail.to_lowercase());
        if let Some(&allowed) = self
            .permissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(allowed);
        }
        let allowed = self.inner.can_send_to_group(sender, group)?;
        self.permissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, allowed);
        Ok(allowed)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn entry(mail: &str, allowed: &[&str]) -> GroupEntry {
        GroupEntry {
            group: Group::new(mail),
            allowed_senders: allowed.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn test_reply_to_defaults_and_overrides() {
        let plain = Group::new("dl@example.com").with_display_name("Engineering");
        assert_eq!(plain.reply_to(), "Engineering <dl@example.com>");

        let overridden = Group::new("dl@example.com")
            .with_display_name("Engineering")
            .with_reply_to("owner@example.com", "List Owner");
        assert_eq!(overridden.reply_to(), "List Owner <owner@example.com>");

        let blank = Group::new("dl@example.com")
            .with_display_name("Engineering")
            .with_reply_to("  ", "");
        assert_eq!(blank.reply_to(), "Engineering <dl@example.com>");

        assert_eq!(Group::new("bare@example.com").reply_to(), "bare@example.com");
    }

    #[test]
    fn test_format_mailbox_quotes_specials() {
        assert_eq!(
            format_mailbox("Doe, Jane", "jane@example.com"),
            "\"Doe, Jane\" <jane@example.com>"
        );
        assert_eq!(
            format_mailbox("Say \"hi\".", "a@b"),
            "\"Say \\\"hi\\\".\" <a@b>"
        );
    }

    #[test]
    fn test_static_directory_resolution() {
        let dir = StaticDirectory::new([entry("DL@example.com", &[])]);
        assert_eq!(dir.len(), 1);
        assert!(dir.resolve_group("dl@example.com").unwrap().is_some());
        assert!(dir.resolve_group("person@example.com").unwrap().is_none());
    }

    #[test]
    fn test_static_directory_policy() {
        let dir = StaticDirectory::new([
            entry("open@example.com", &[]),
            entry("closed@example.com", &["boss@example.com", "*@partner.org"]),
        ]);
        let open = Group::new("open@example.com");
        let closed = Group::new("closed@example.com");

        assert!(dir.can_send_to_group("anyone@else.net", &open).unwrap());
        assert!(dir.can_send_to_group("Boss@Example.com", &closed).unwrap());
        assert!(dir.can_send_to_group("x@partner.org", &closed).unwrap());
        assert!(!dir.can_send_to_group("x@other.org", &closed).unwrap());
    }

    struct Counting {
        lookups: AtomicUsize,
    }

    impl GroupResolver for Counting {
        fn resolve_group(&self, address: &str) -> Result<Option<Group>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(address.starts_with("dl").then(|| Group::new(address)))
        }
    }

    impl AccessPolicy for Counting {
        fn can_send_to_group(&self, _sender: &str, _group: &Group) -> Result<bool> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
    }

    #[test]
    fn test_cache_until_invalidated() {
        let cached = CachedDirectory::new(Counting {
            lookups: AtomicUsize::new(0),
        });
        let group = Group::new("dl@x");

        assert!(cached.resolve_group("dl@x").unwrap().is_some());
        assert!(cached.resolve_group("DL@x").unwrap().is_some());
        assert!(cached.resolve_group("user@x").unwrap().is_none());
        assert!(cached.resolve_group("user@x").unwrap().is_none());
        assert!(!cached.can_send_to_group("a@x", &group).unwrap());
        assert!(!cached.can_send_to_group("a@x", &group).unwrap());
        assert_eq!(cached.inner().lookups.load(Ordering::SeqCst), 3);
        assert_eq!(cached.cached(), 3);

        assert_eq!(cached.invalidate(), 3);
        assert_eq!(cached.cached(), 0);
        cached.resolve_group("dl@x").unwrap();
        assert_eq!(cached.inner().lookups.load(Ordering::SeqCst), 4);
    }
}
