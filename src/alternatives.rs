//! Alternatives arbiter: per-group ordered provider sequences and the
//! symlinks their head materializes (spec.md §4.6).
//!
//! Grounded on spec.md §4.6's register/unregister/switch lifecycle; the
//! registry's storage shape (a reserved key inside the installed-package
//! database) is named directly by the spec's invariant text,
//! `_DULGE_ALTERNATIVES_`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::events::{AltGroupEvent, EventSink, HandleEvent};
use crate::plist::{Mapping, Sequence, Value};
use crate::types::Descriptor;

/// The reserved database key under which the alternatives registry is
/// persisted (spec.md §3 invariant naming).
pub const ALTERNATIVES_KEY: &str = "_DULGE_ALTERNATIVES_";

/// Registry of alternatives groups: `group-name -> ordered pkgname list`,
/// head = active provider.
#[derive(Debug, Clone, Default)]
pub struct AlternativesRegistry {
    groups: HashMap<String, Vec<String>>,
}

impl AlternativesRegistry {
    /// Builds a registry from the reserved-key mapping stored in the
    /// installed-package database, if present.
    #[must_use]
    pub fn from_mapping(map: Option<&Mapping>) -> Self {
        let mut groups = HashMap::new();
        if let Some(map) = map {
            for (group, value) in map.iter() {
                if let Some(seq) = value.as_seq() {
                    groups.insert(group.to_string(), seq.strings().map(str::to_string).collect());
                }
            }
        }
        Self { groups }
    }

    /// Serializes this registry back to the mapping shape the database
    /// stores under [`ALTERNATIVES_KEY`].
    #[must_use]
    pub fn to_mapping(&self) -> Mapping {
        let mut map = Mapping::new();
        for (group, providers) in &self.groups {
            let seq: Sequence = providers.iter().map(Value::str).collect();
            let _ = map.insert(group.clone(), Value::Seq(seq));
        }
        map
    }

    /// The current head (active provider) for `group`, if it exists.
    #[must_use]
    pub fn head(&self, group: &str) -> Option<&str> {
        self.groups.get(group).and_then(|v| v.first()).map(String::as_str)
    }

    /// Every provider of `group`, head first.
    #[must_use]
    pub fn providers(&self, group: &str) -> &[String] {
        self.groups.get(group).map_or(&[], Vec::as_slice)
    }

    /// The groups `pkgname` currently provides (any position).
    #[must_use]
    pub fn groups_containing(&self, pkgname: &str) -> Vec<String> {
        self.groups
            .iter()
            .filter(|(_, v)| v.iter().any(|p| p == pkgname))
            .map(|(g, _)| g.clone())
            .collect()
    }

    fn providers_mut(&mut self, group: &str) -> &mut Vec<String> {
        self.groups.entry(group.to_string()).or_default()
    }

    fn remove_group(&mut self, group: &str) {
        self.groups.remove(group);
    }
}

fn split_link_spec(spec: &str) -> Result<(&str, &str)> {
    spec.split_once(':')
        .ok_or_else(|| Error::InvalidArgument(format!("malformed alternative entry: {spec}")))
}

fn resolve_paths(rootdir: &Path, link: &str, target: &str) -> (PathBuf, PathBuf) {
    let target_abs = rootdir.join(target.trim_start_matches('/'));
    let link_abs = if link.starts_with('/') {
        rootdir.join(link.trim_start_matches('/'))
    } else {
        target_abs.parent().unwrap_or(rootdir).join(link)
    };
    (link_abs, target_abs)
}

/// Computes `to`'s path relative to `from_dir`, used to rewrite an absolute
/// TARGET into a relative symlink destination (spec.md §4.6).
fn relative_path(from_dir: &Path, to: &Path) -> PathBuf {
    let from: Vec<_> = from_dir.components().collect();
    let dest: Vec<_> = to.components().collect();
    let common = from.iter().zip(dest.iter()).take_while(|(a, b)| a == b).count();
    let mut result = PathBuf::new();
    for _ in common..from.len() {
        result.push("..");
    }
    for c in &dest[common..] {
        result.push(c.as_os_str());
    }
    result
}

fn materialize_symlink(rootdir: &Path, spec: &str, group: &str, pkgname: &str, events: &EventSink) -> Result<()> {
    let (link, target) = split_link_spec(spec)?;
    let (link_abs, target_abs) = resolve_paths(rootdir, link, target);
    if let Some(parent) = link_abs.parent() {
        fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o755)).ok();
        }
    }
    if link_abs.symlink_metadata().is_ok() {
        fs::remove_file(&link_abs)?;
    }
    let rel_target = relative_path(link_abs.parent().unwrap_or(rootdir), &target_abs);
    #[cfg(unix)]
    std::os::unix::fs::symlink(&rel_target, &link_abs)?;
    #[cfg(not(unix))]
    fs::write(&link_abs, rel_target.to_string_lossy().as_bytes())?;
    (events)(HandleEvent::Alternatives(AltGroupEvent::LinkAdded {
        group: group.to_string(),
        link: link_abs.to_string_lossy().into_owned(),
        target: rel_target.to_string_lossy().into_owned(),
    }));
    Ok(())
}

fn remove_symlink(rootdir: &Path, spec: &str, group: &str, events: &EventSink) -> Result<()> {
    let (link, target) = split_link_spec(spec)?;
    let (link_abs, _) = resolve_paths(rootdir, link, target);
    if link_abs.symlink_metadata().is_ok() {
        fs::remove_file(&link_abs)?;
    }
    (events)(HandleEvent::Alternatives(AltGroupEvent::LinkRemoved {
        group: group.to_string(),
        link: link_abs.to_string_lossy().into_owned(),
    }));
    Ok(())
}

fn link_specs_for(descriptor: &Descriptor, group: &str) -> Vec<String> {
    descriptor
        .alternatives()
        .and_then(|m| m.get_seq(group))
        .map(|seq| seq.strings().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Registers a newly-installed or upgraded package's alternatives
/// (spec.md §4.6 "Register event").
///
/// # Errors
/// Propagates symlink I/O failures.
pub fn register(registry: &mut AlternativesRegistry, rootdir: &Path, pkgname: &str, descriptor: &Descriptor, events: &EventSink) -> Result<()> {
    let Some(alts) = descriptor.alternatives() else { return Ok(()) };
    let groups: Vec<String> = alts.keys().map(str::to_string).collect();
    for group in groups {
        let specs = link_specs_for(descriptor, &group);
        let is_new_group = registry.providers(&group).is_empty();
        let is_head = registry.head(&group) == Some(pkgname);
        let is_listed = registry.providers(&group).iter().any(|p| p == pkgname);

        if is_new_group {
            registry.providers_mut(&group).push(pkgname.to_string());
            for spec in &specs {
                materialize_symlink(rootdir, spec, &group, pkgname, events)?;
            }
            (events)(HandleEvent::Alternatives(AltGroupEvent::Added { group, pkgname: pkgname.to_string() }));
        } else if is_head {
            for spec in &specs {
                materialize_symlink(rootdir, spec, &group, pkgname, events)?;
            }
        } else if !is_listed {
            registry.providers_mut(&group).push(pkgname.to_string());
            (events)(HandleEvent::Alternatives(AltGroupEvent::GroupAdded { group, pkgname: pkgname.to_string() }));
        }
        // present but not head: no-op on plain register, per spec.md §4.6.
    }
    Ok(())
}

/// Explicitly switches `group`'s head to `pkgname` (spec.md §4.6 "Switch").
///
/// # Errors
/// Returns [`Error::NotFound`] if `pkgname` is not already a provider of
/// `group`; propagates symlink I/O failures.
pub fn switch(registry: &mut AlternativesRegistry, rootdir: &Path, group: &str, pkgname: &str, descriptor: &Descriptor, events: &EventSink) -> Result<()> {
    if !registry.providers(group).iter().any(|p| p == pkgname) {
        return Err(Error::NotFound(format!("{pkgname} does not provide {group}")));
    }
    let providers = registry.providers_mut(group);
    providers.retain(|p| p != pkgname);
    providers.insert(0, pkgname.to_string());

    for spec in link_specs_for(descriptor, group) {
        materialize_symlink(rootdir, &spec, group, pkgname, events)?;
    }
    (events)(HandleEvent::Alternatives(AltGroupEvent::Switched {
        group: group.to_string(),
        pkgname: pkgname.to_string(),
    }));
    Ok(())
}

/// Unregisters a package being removed (spec.md §4.6 "Unregister event").
///
/// `is_update` marks a reinstall/update rather than a true removal (the pkg
/// stays listed). `pure_meta_removal` marks a package with no
/// `run_depends`/`shlib-requires` (promotes the next-head instead of the
/// newest fallback).
///
/// # Errors
/// Propagates symlink I/O failures.
pub fn unregister(
    registry: &mut AlternativesRegistry,
    rootdir: &Path,
    pkgname: &str,
    descriptor: &Descriptor,
    is_update: bool,
    pure_meta_removal: bool,
    descriptor_of: impl Fn(&str) -> Option<Descriptor>,
    events: &EventSink,
) -> Result<()> {
    for group in registry.groups_containing(pkgname) {
        let was_head = registry.head(&group) == Some(pkgname);
        if was_head {
            for spec in link_specs_for(descriptor, &group) {
                remove_symlink(rootdir, &spec, &group, events)?;
            }
        }

        if is_update {
            continue;
        }

        let providers = registry.providers_mut(&group);
        providers.retain(|p| p != pkgname);
        if providers.is_empty() {
            registry.remove_group(&group);
            (events)(HandleEvent::Alternatives(AltGroupEvent::Removed {
                group: group.clone(),
                pkgname: pkgname.to_string(),
            }));
            continue;
        }

        if !was_head {
            continue;
        }

        let providers = registry.providers_mut(&group);
        let new_head = if pure_meta_removal {
            providers[0].clone()
        } else {
            let last = providers.last().expect("non-empty").clone();
            providers.retain(|p| p != &last);
            providers.insert(0, last.clone());
            last
        };

        if let Some(new_desc) = descriptor_of(&new_head) {
            for spec in link_specs_for(&new_desc, &group) {
                materialize_symlink(rootdir, &spec, &group, &new_head, events)?;
            }
        }
        (events)(HandleEvent::Alternatives(AltGroupEvent::Switched { group, pkgname: new_head }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::silent_sink;
    use std::sync::{Arc, Mutex};

    fn descriptor_with_alt(pkgname: &str, group: &str, link: &str, target: &str) -> Descriptor {
        let mut d = Descriptor::new(pkgname, "1.0", "1", "x86_64");
        let mut alts = Mapping::new();
        let seq: Sequence = std::iter::once(Value::str(format!("{link}:{target}"))).collect();
        alts.insert(group, Value::Seq(seq)).unwrap();
        let _ = d.as_mapping_mut().insert("alternatives", Value::Map(alts));
        d
    }

    #[test]
    fn register_creates_group_and_materializes_link() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("usr/bin")).unwrap();
        fs::write(dir.path().join("usr/bin/vi"), "#!/bin/sh").unwrap();
        let desc = descriptor_with_alt("vi", "editor", "/usr/bin/editor", "/usr/bin/vi");
        let mut registry = AlternativesRegistry::default();
        register(&mut registry, dir.path(), "vi", &desc, &silent_sink()).unwrap();
        assert_eq!(registry.head("editor"), Some("vi"));
        assert!(dir.path().join("usr/bin/editor").symlink_metadata().is_ok());
    }

    #[test]
    fn switch_promotes_new_head_and_tracks_events() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("usr/bin")).unwrap();
        let vi = descriptor_with_alt("vi", "editor", "/usr/bin/editor", "/usr/bin/vi");
        let nano = descriptor_with_alt("nano", "editor", "/usr/bin/editor", "/usr/bin/nano");
        let mut registry = AlternativesRegistry::default();
        register(&mut registry, dir.path(), "vi", &vi, &silent_sink()).unwrap();
        register(&mut registry, dir.path(), "nano", &nano, &silent_sink()).unwrap();
        assert_eq!(registry.providers("editor"), &["vi".to_string(), "nano".to_string()]);

        let events: Arc<Mutex<Vec<AltGroupEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let sink: EventSink = Arc::new(move |e| {
            if let HandleEvent::Alternatives(a) = e {
                events_clone.lock().unwrap().push(a);
            }
        });
        switch(&mut registry, dir.path(), "editor", "nano", &nano, &sink).unwrap();
        assert_eq!(registry.head("editor"), Some("nano"));
        assert!(events.lock().unwrap().iter().any(|e| matches!(e, AltGroupEvent::Switched { .. })));
    }
}
