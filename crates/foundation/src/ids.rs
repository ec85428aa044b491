/// Identifier tying derived caches (spatial index, score lists) to one dataset version.
///
/// Typically the hex fingerprint of the loaded dataset.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationKey(String);

impl GenerationKey {
    pub fn new(key: impl Into<String>) -> Self {
        GenerationKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for GenerationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GenerationKey {
    fn from(value: &str) -> Self {
        GenerationKey::new(value)
    }
}
