/// Step descriptors and the in-memory descriptor store
///
/// A descriptor is an immutable, parameterized step definition. Binding it to
/// concrete parameter values yields a `ResolvedStep`, which is what stages hold
/// and what the cache is keyed on.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::cache_key::{compute_cache_key, descriptor_fingerprint};
use crate::error::{Result, StrataError};

/// Resolved parameter values, always sorted by name
pub type Params = BTreeMap<String, String>;

/// Expected result marker: a file the step must leave behind with a known SHA-256
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultMarker {
    pub path: String,
    pub sha256: String,
}

impl ResultMarker {
    /// Parse `sha256:<hex>:<path>`
    pub fn parse(spec: &str) -> Option<Self> {
        let rest = spec.strip_prefix("sha256:")?;
        let (hash, path) = rest.split_once(':')?;

        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) || path.is_empty() {
            return None;
        }

        Some(Self {
            path: path.to_string(),
            sha256: hash.to_ascii_lowercase(),
        })
    }

    /// Check the marker against a file's content
    pub fn matches(&self, content: &[u8]) -> bool {
        hex::encode(Sha256::digest(content)) == self.sha256
    }
}

impl fmt::Display for ResultMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}:{}", self.sha256, self.path)
    }
}

/// Parameterized step definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDescriptor {
    id: String,
    command: String,
    declared_params: BTreeSet<String>,
    env: BTreeMap<String, String>,
    outputs: Vec<String>,
    expect: Option<ResultMarker>,
}

impl StepDescriptor {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            declared_params: BTreeSet::new(),
            env: BTreeMap::new(),
            outputs: Vec::new(),
            expect: None,
        }
    }

    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared_params
            .extend(params.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<String>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_expect(mut self, expect: Option<ResultMarker>) -> Self {
        self.expect = expect;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn expect(&self) -> Option<&ResultMarker> {
        self.expect.as_ref()
    }

    /// Declared parameters plus every placeholder used by the command or env templates
    pub fn required_params(&self) -> BTreeSet<String> {
        let mut required = self.declared_params.clone();
        required.extend(placeholders(&self.command));
        for value in self.env.values() {
            required.extend(placeholders(value));
        }
        required
    }
}

/// A descriptor bound to concrete parameter values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStep {
    descriptor: Arc<StepDescriptor>,
    params: Params,
}

impl ResolvedStep {
    pub fn id(&self) -> &str {
        self.descriptor.id()
    }

    pub fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Cache key derived from (descriptor id, sorted parameter values)
    pub fn cache_key(&self) -> String {
        compute_cache_key(self.id(), &self.params)
    }

    /// Fingerprint of the descriptor body, used to detect edited definitions
    pub fn fingerprint(&self) -> String {
        descriptor_fingerprint(&self.descriptor)
    }

    /// Command with all placeholders substituted
    pub fn command(&self) -> String {
        render(self.descriptor.command(), &self.params)
    }

    /// Extra environment with all placeholders substituted
    pub fn env(&self) -> BTreeMap<String, String> {
        self.descriptor
            .env()
            .iter()
            .map(|(name, value)| (name.clone(), render(value, &self.params)))
            .collect()
    }
}

/// Registry of step descriptors, keyed by id
#[derive(Debug, Default)]
pub struct DescriptorStore {
    descriptors: BTreeMap<String, Arc<StepDescriptor>>,
}

impl DescriptorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor; ids are unique
    pub fn register(&mut self, descriptor: StepDescriptor) -> Result<()> {
        if self.descriptors.contains_key(descriptor.id()) {
            return Err(StrataError::DuplicateId(descriptor.id().to_string()));
        }

        self.descriptors
            .insert(descriptor.id().to_string(), Arc::new(descriptor));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&StepDescriptor> {
        self.descriptors.get(id).map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Bind a descriptor to parameter values
    ///
    /// Only the descriptor's required parameters are kept, so unrelated values
    /// in `params` never leak into the cache key.
    pub fn resolve(&self, id: &str, params: &Params) -> Result<ResolvedStep> {
        let descriptor = self
            .descriptors
            .get(id)
            .ok_or_else(|| StrataError::UnknownStep(id.to_string()))?;

        let mut bound = Params::new();
        for name in descriptor.required_params() {
            match params.get(&name) {
                Some(value) => {
                    bound.insert(name, value.clone());
                }
                None => {
                    return Err(StrataError::MissingParameter {
                        step_id: id.to_string(),
                        parameter: name,
                    })
                }
            }
        }

        Ok(ResolvedStep {
            descriptor: Arc::clone(descriptor),
            params: bound,
        })
    }
}

/// Extract `{{name}}` placeholder names from a template
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };

        let name = after[..end].trim();
        if !name.is_empty() {
            names.push(name.to_string());
        }
        rest = &after[end + 2..];
    }

    names
}

/// Substitute `{{name}}` placeholders; unknown names are left untouched
pub fn render(template: &str, params: &Params) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };

        out.push_str(&rest[..start]);
        let name = after[..end].trim();
        match params.get(name) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_register_rejects_duplicate_id() {
        let mut store = DescriptorStore::new();
        store
            .register(StepDescriptor::new("install-base-packages", "true"))
            .unwrap();

        let err = store
            .register(StepDescriptor::new("install-base-packages", "false"))
            .unwrap_err();
        assert!(matches!(err, StrataError::DuplicateId(id) if id == "install-base-packages"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_resolve_requires_placeholders_and_declared_params() {
        let mut store = DescriptorStore::new();
        store
            .register(
                StepDescriptor::new("install-neovim", "fetch nvim-{{version}}")
                    .with_params(["arch"]),
            )
            .unwrap();

        let err = store
            .resolve("install-neovim", &params(&[("version", "0.10.4")]))
            .unwrap_err();
        assert!(matches!(
            err,
            StrataError::MissingParameter { ref parameter, .. } if parameter == "arch"
        ));

        let step = store
            .resolve(
                "install-neovim",
                &params(&[("version", "0.10.4"), ("arch", "arm64"), ("unused", "x")]),
            )
            .unwrap();
        assert_eq!(step.command(), "fetch nvim-0.10.4");
        assert!(!step.params().contains_key("unused"));
    }

    #[test]
    fn test_resolve_unknown_step() {
        let store = DescriptorStore::new();
        let err = store.resolve("nope", &Params::new()).unwrap_err();
        assert!(matches!(err, StrataError::UnknownStep(_)));
    }

    #[test]
    fn test_env_placeholders_are_required_and_rendered() {
        let mut env = BTreeMap::new();
        env.insert("NVIM_VERSION".to_string(), "v{{ version }}".to_string());
        let descriptor = StepDescriptor::new("install-neovim", "true").with_env(env);

        assert!(descriptor.required_params().contains("version"));

        let mut store = DescriptorStore::new();
        store.register(descriptor).unwrap();
        let step = store
            .resolve("install-neovim", &params(&[("version", "0.9.5")]))
            .unwrap();
        assert_eq!(step.env()["NVIM_VERSION"], "v0.9.5");
    }

    #[test]
    fn test_render_leaves_unterminated_and_unknown_placeholders() {
        let p = params(&[("arch", "arm64")]);
        assert_eq!(render("{{arch}}-{{other}}", &p), "arm64-{{other}}");
        assert_eq!(render("echo ${HOME} {{arch", &p), "echo ${HOME} {{arch");
    }

    #[test]
    fn test_result_marker_parse() {
        let hash = hex::encode(Sha256::digest(b"nvim"));
        let marker = ResultMarker::parse(&format!("sha256:{}:opt/nvim/bin/nvim", hash)).unwrap();
        assert_eq!(marker.path, "opt/nvim/bin/nvim");
        assert!(marker.matches(b"nvim"));
        assert!(!marker.matches(b"vim"));

        assert!(ResultMarker::parse("md5:abc:file").is_none());
        assert!(ResultMarker::parse("sha256:abc:file").is_none());
        assert!(ResultMarker::parse(&format!("sha256:{}:", hash)).is_none());
    }
}
