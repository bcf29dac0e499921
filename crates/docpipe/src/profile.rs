//! Output profiles: the tenant/category rendering configuration.
//!
//! A profile declares which formats to render, the exact field order with
//! per-field labels/types/transforms, and the extraction prompt forwarded to
//! the LLM collaborator. Resolution follows a strict fallback: an *active*
//! tenant override wins, otherwise the category default is used, otherwise
//! resolution fails — jobs are never accepted with a silently empty profile.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::collab::ProfileStore;
use crate::error::ProfileError;

/// Serialized output format a profile can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Csv,
    Json,
    Xml,
    Xlsx,
}

impl OutputFormat {
    /// File extension without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
            OutputFormat::Xml => "xml",
            OutputFormat::Xlsx => "xlsx",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.extension())
    }
}

/// Declared type of a field's value. Extracted values are validated against
/// this before rendering; a value that fails its declared type is treated as
/// absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Text,
    Number,
    Date,
    Boolean,
}

/// Transform applied to a field's rendered string form.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FieldTransform {
    #[default]
    None,
    Uppercase,
    Lowercase,
    Titlecase,
    /// Reformat a date value using the given chrono format string.
    Date { format: String },
    /// Format a numeric value as currency: symbol, thousands grouping,
    /// fixed decimal places.
    Currency { symbol: String, decimals: u32 },
    Prefix { literal: String },
    Suffix { literal: String },
    RegexReplace { pattern: String, replacement: String },
}

/// One entry of a profile's ordered field list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Key looked up in the extracted record's field map.
    pub name: String,
    /// Column header / JSON key in rendered output.
    pub display_label: String,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub transform: FieldTransform,
    #[serde(default)]
    pub is_required: bool,
    /// Substituted when a required field is absent from a record.
    #[serde(default)]
    pub default_value: Option<String>,
}

impl FieldSpec {
    /// Plain text field with label equal to its name. Test and fixture
    /// convenience.
    pub fn text(name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_label: name.to_string(),
            kind: FieldKind::Text,
            transform: FieldTransform::None,
            is_required: false,
            default_value: None,
        }
    }
}

/// Where a resolved profile came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileSource {
    TenantOverride,
    #[default]
    Default,
}

/// Resolved rendering configuration for one (tenant, category) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputProfile {
    pub profile_id: String,
    #[serde(default)]
    pub source: ProfileSource,
    /// Tenant overrides may be staged but inactive; inactive overrides are
    /// skipped during resolution. Defaults are implicitly active.
    #[serde(default = "default_active")]
    pub active: bool,
    pub formats: Vec<OutputFormat>,
    pub field_order: Vec<FieldSpec>,
    /// Opaque instruction block forwarded verbatim to the LLM collaborator.
    #[serde(default)]
    pub extraction_prompt: String,
    #[serde(default = "default_csv_delimiter")]
    pub csv_delimiter: char,
    #[serde(default = "default_include_header")]
    pub include_header: bool,
    /// Output format for date-typed fields without an explicit date
    /// transform.
    #[serde(default = "default_date_format")]
    pub date_format: String,
    /// Rendered in place of absent optional fields.
    #[serde(default)]
    pub null_placeholder: String,
}

fn default_active() -> bool {
    true
}

fn default_csv_delimiter() -> char {
    ','
}

fn default_include_header() -> bool {
    true
}

fn default_date_format() -> String {
    "%Y-%m-%d".to_string()
}

impl OutputProfile {
    /// Checks the structural invariants a profile must satisfy before any
    /// job is accepted against it: at least one format, at least one field,
    /// compilable regex transforms, and parsable date format strings.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.formats.is_empty() {
            return Err(ProfileError::NoFormats {
                profile_id: self.profile_id.clone(),
            });
        }
        if self.field_order.is_empty() {
            return Err(ProfileError::NoFields {
                profile_id: self.profile_id.clone(),
            });
        }
        validate_date_format("date_format", &self.date_format)?;
        for field in &self.field_order {
            match &field.transform {
                FieldTransform::RegexReplace { pattern, .. } => {
                    if let Err(e) = regex::Regex::new(pattern) {
                        return Err(ProfileError::InvalidPattern {
                            field: field.name.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
                FieldTransform::Date { format } => {
                    validate_date_format(&field.name, format)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Field spec lookup by field-map key.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.field_order.iter().find(|f| f.name == name)
    }
}

/// Rejects chrono format strings that would fail at render time.
fn validate_date_format(field: &str, format: &str) -> Result<(), ProfileError> {
    use chrono::format::{Item, StrftimeItems};

    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(ProfileError::InvalidPattern {
            field: field.to_string(),
            reason: format!("invalid date format string '{format}'"),
        });
    }
    Ok(())
}

/// Resolves the effective profile for a (tenant, category) pair against the
/// injected profile store. Read-only.
pub struct ProfileResolver {
    store: Arc<dyn ProfileStore>,
}

impl ProfileResolver {
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self { store }
    }

    /// Returns the effective profile, validated. An active tenant override
    /// always wins; otherwise the category default; otherwise
    /// [`ProfileError::MissingDefault`].
    pub fn resolve(&self, tenant_id: &str, category_id: u32) -> Result<OutputProfile, ProfileError> {
        if let Some(mut profile) = self.store.tenant_profile(tenant_id, category_id)? {
            if profile.active {
                profile.source = ProfileSource::TenantOverride;
                profile.validate()?;
                log::debug!(
                    "Resolved tenant override profile '{}' for {}/{}",
                    profile.profile_id,
                    tenant_id,
                    category_id
                );
                return Ok(profile);
            }
            log::debug!(
                "Tenant profile '{}' for {}/{} is inactive; falling back to default",
                profile.profile_id,
                tenant_id,
                category_id
            );
        }

        let mut profile = self
            .store
            .default_profile(category_id)?
            .ok_or(ProfileError::MissingDefault { category_id })?;
        profile.source = ProfileSource::Default;
        profile.validate()?;
        Ok(profile)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::minimal_profile as profile;
    use super::*;
    use crate::collab::StaticProfileStore;

    #[test]
    fn default_used_when_no_tenant_override() {
        let store = StaticProfileStore::new().with_default(7, profile("cat7-default"));
        let resolver = ProfileResolver::new(Arc::new(store));

        let resolved = resolver.resolve("any-tenant", 7).unwrap();
        assert_eq!(resolved.profile_id, "cat7-default");
        assert_eq!(resolved.source, ProfileSource::Default);
    }

    #[test]
    fn active_tenant_override_wins_only_for_that_tenant() {
        let store = StaticProfileStore::new()
            .with_default(7, profile("cat7-default"))
            .with_tenant("acme", 7, profile("acme-custom"));
        let resolver = ProfileResolver::new(Arc::new(store));

        let acme = resolver.resolve("acme", 7).unwrap();
        assert_eq!(acme.profile_id, "acme-custom");
        assert_eq!(acme.source, ProfileSource::TenantOverride);

        let other = resolver.resolve("globex", 7).unwrap();
        assert_eq!(other.profile_id, "cat7-default");
        assert_eq!(other.source, ProfileSource::Default);
    }

    #[test]
    fn inactive_tenant_override_falls_back_to_default() {
        let mut inactive = profile("acme-staged");
        inactive.active = false;
        let store = StaticProfileStore::new()
            .with_default(7, profile("cat7-default"))
            .with_tenant("acme", 7, inactive);
        let resolver = ProfileResolver::new(Arc::new(store));

        let resolved = resolver.resolve("acme", 7).unwrap();
        assert_eq!(resolved.profile_id, "cat7-default");
    }

    #[test]
    fn missing_default_is_an_error() {
        let resolver = ProfileResolver::new(Arc::new(StaticProfileStore::new()));
        let err = resolver.resolve("acme", 42).unwrap_err();
        assert!(matches!(
            err,
            ProfileError::MissingDefault { category_id: 42 }
        ));
    }

    #[test]
    fn profile_without_formats_fails_validation() {
        let mut p = profile("empty-formats");
        p.formats.clear();
        assert!(matches!(p.validate(), Err(ProfileError::NoFormats { .. })));
    }

    #[test]
    fn profile_with_bad_regex_fails_validation() {
        let mut p = profile("bad-regex");
        p.field_order[0].transform = FieldTransform::RegexReplace {
            pattern: "([unclosed".to_string(),
            replacement: String::new(),
        };
        let err = p.validate().unwrap_err();
        assert!(matches!(err, ProfileError::InvalidPattern { .. }));
    }

    #[test]
    fn profile_with_bad_date_format_fails_validation() {
        let mut p = profile("bad-date");
        p.field_order[0].transform = FieldTransform::Date {
            format: "%Q-%Z!".to_string(),
        };
        let err = p.validate().unwrap_err();
        assert!(matches!(err, ProfileError::InvalidPattern { .. }));

        let mut p = profile("bad-default-date");
        p.date_format = "%q".to_string();
        assert!(matches!(
            p.validate(),
            Err(ProfileError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn transform_deserializes_from_tagged_yaml() {
        let spec: FieldSpec = serde_yaml::from_str(
            r#"
            name: amount
            display_label: Amount
            kind: number
            transform:
              op: currency
              symbol: "$"
              decimals: 2
            is_required: true
            default_value: "0.00"
            "#,
        )
        .unwrap();
        assert_eq!(spec.kind, FieldKind::Number);
        assert_eq!(
            spec.transform,
            FieldTransform::Currency {
                symbol: "$".to_string(),
                decimals: 2
            }
        );
    }
}
