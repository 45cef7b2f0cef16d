//! Package descriptor: the mapping shape described for an installed or
//! repository-indexed package.

use crate::plist::{Mapping, Sequence, Value};

/// Runtime state of an installed package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Archive unpacked but not yet configured.
    Unpacked,
    /// Fully installed and configured.
    Installed,
    /// Files present but registration is inconsistent.
    Broken,
    /// Removal interrupted after file removal but before database purge.
    HalfRemoved,
    /// Not installed (transient; such entries should not persist in the
    /// database per the invariant in spec.md §3).
    NotInstalled,
}

impl State {
    /// Parses the on-disk string tag.
    #[must_use]
    pub fn from_str_tag(s: &str) -> Option<Self> {
        match s {
            "unpacked" => Some(Self::Unpacked),
            "installed" => Some(Self::Installed),
            "broken" => Some(Self::Broken),
            "half-removed" => Some(Self::HalfRemoved),
            "not-installed" => Some(Self::NotInstalled),
            _ => None,
        }
    }

    /// The on-disk string tag.
    #[must_use]
    pub fn as_str_tag(self) -> &'static str {
        match self {
            Self::Unpacked => "unpacked",
            Self::Installed => "installed",
            Self::Broken => "broken",
            Self::HalfRemoved => "half-removed",
            Self::NotInstalled => "not-installed",
        }
    }
}

/// A package descriptor: a typed view over a property-tree mapping holding
/// the keys enumerated in spec.md §3 ("Package descriptor").
#[derive(Debug, Clone)]
pub struct Descriptor(Mapping);

impl Descriptor {
    /// Wraps an existing mapping as a descriptor without validation.
    #[must_use]
    pub fn from_mapping(map: Mapping) -> Self {
        Self(map)
    }

    /// Starts building a minimal descriptor from its three identifying
    /// fields, deriving `pkgver` and `pkgname` together.
    #[must_use]
    pub fn new(pkgname: &str, version: &str, revision: &str, architecture: &str) -> Self {
        let mut map = Mapping::new();
        let pkgver = format!("{pkgname}-{version}_{revision}");
        let _ = map.insert("pkgname", Value::str(pkgname));
        let _ = map.insert("pkgver", Value::str(pkgver));
        let _ = map.insert("architecture", Value::str(architecture));
        Self(map)
    }

    /// Borrows the underlying mapping.
    #[must_use]
    pub fn as_mapping(&self) -> &Mapping {
        &self.0
    }

    /// Mutably borrows the underlying mapping.
    pub fn as_mapping_mut(&mut self) -> &mut Mapping {
        &mut self.0
    }

    /// Consumes the descriptor, returning the underlying mapping.
    #[must_use]
    pub fn into_mapping(self) -> Mapping {
        self.0
    }

    /// The `pkgname` key.
    #[must_use]
    pub fn pkgname(&self) -> &str {
        self.0.get_str("pkgname").unwrap_or_default()
    }

    /// The `pkgver` key.
    #[must_use]
    pub fn pkgver(&self) -> &str {
        self.0.get_str("pkgver").unwrap_or_default()
    }

    /// The `architecture` key.
    #[must_use]
    pub fn architecture(&self) -> &str {
        self.0.get_str("architecture").unwrap_or_default()
    }

    /// The `repository` key (URL this descriptor was sourced from), if set.
    #[must_use]
    pub fn repository(&self) -> Option<&str> {
        self.0.get_str("repository")
    }

    /// Sets the `repository` key.
    pub fn set_repository(&mut self, url: &str) {
        let _ = self.0.insert("repository", Value::str(url));
    }

    /// `installed_size`, in bytes.
    #[must_use]
    pub fn installed_size(&self) -> u64 {
        self.0.get_uint("installed_size").unwrap_or(0)
    }

    /// `filename-size`, in bytes.
    #[must_use]
    pub fn filename_size(&self) -> u64 {
        self.0.get_uint("filename-size").unwrap_or(0)
    }

    /// `filename-sha256`, lowercase hex.
    #[must_use]
    pub fn filename_sha256(&self) -> Option<&str> {
        self.0.get_str("filename-sha256")
    }

    /// `hold` flag.
    #[must_use]
    pub fn hold(&self) -> bool {
        self.0.get_bool("hold")
    }

    /// Sets the `hold` flag.
    pub fn set_hold(&mut self, hold: bool) {
        let _ = self.0.insert("hold", Value::Bool(hold));
    }

    /// `repolock` flag.
    #[must_use]
    pub fn repolock(&self) -> bool {
        self.0.get_bool("repolock")
    }

    /// Sets the `repolock` flag.
    pub fn set_repolock(&mut self, repolock: bool) {
        let _ = self.0.insert("repolock", Value::Bool(repolock));
    }

    /// `automatic-install` flag.
    #[must_use]
    pub fn automatic_install(&self) -> bool {
        self.0.get_bool("automatic-install")
    }

    /// Sets the `automatic-install` flag.
    pub fn set_automatic_install(&mut self, auto: bool) {
        let _ = self.0.insert("automatic-install", Value::Bool(auto));
    }

    /// Parsed `state` key, defaulting to `NotInstalled` if unset/unknown.
    #[must_use]
    pub fn state(&self) -> State {
        self.0
            .get_str("state")
            .and_then(State::from_str_tag)
            .unwrap_or(State::NotInstalled)
    }

    /// Sets the `state` key.
    pub fn set_state(&mut self, state: State) {
        let _ = self.0.insert("state", Value::str(state.as_str_tag()));
    }

    /// `run_depends` patterns.
    pub fn run_depends(&self) -> impl Iterator<Item = &str> {
        self.0
            .get_seq("run_depends")
            .into_iter()
            .flat_map(Sequence::strings)
    }

    /// `provides` pkgver strings (virtual packages this descriptor advertises).
    pub fn provides(&self) -> impl Iterator<Item = &str> {
        self.0
            .get_seq("provides")
            .into_iter()
            .flat_map(Sequence::strings)
    }

    /// `replaces` patterns.
    pub fn replaces(&self) -> impl Iterator<Item = &str> {
        self.0
            .get_seq("replaces")
            .into_iter()
            .flat_map(Sequence::strings)
    }

    /// `conflicts` patterns.
    pub fn conflicts(&self) -> impl Iterator<Item = &str> {
        self.0
            .get_seq("conflicts")
            .into_iter()
            .flat_map(Sequence::strings)
    }

    /// `shlib-requires` sonames.
    pub fn shlib_requires(&self) -> impl Iterator<Item = &str> {
        self.0
            .get_seq("shlib-requires")
            .into_iter()
            .flat_map(Sequence::strings)
    }

    /// `shlib-provides` sonames.
    pub fn shlib_provides(&self) -> impl Iterator<Item = &str> {
        self.0
            .get_seq("shlib-provides")
            .into_iter()
            .flat_map(Sequence::strings)
    }

    /// `reverts` field, raw space-separated string.
    #[must_use]
    pub fn reverts(&self) -> &str {
        self.0.get_str("reverts").unwrap_or("")
    }

    /// The `alternatives` mapping: group name -> `LINK:TARGET` strings.
    #[must_use]
    pub fn alternatives(&self) -> Option<&Mapping> {
        self.0.get_map("alternatives")
    }

    /// Sets a list-valued key to the given strings, creating the sequence.
    pub fn set_string_list(&mut self, key: &str, values: impl IntoIterator<Item = impl Into<String>>) {
        let seq: Sequence = values.into_iter().map(|v| Value::str(v.into())).collect();
        let _ = self.0.insert(key, Value::Seq(seq));
    }
}
