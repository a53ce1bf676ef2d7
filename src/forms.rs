//! Form schema registry.
//!
//! Each supported form has a JSON definition under `configs/forms/`: the
//! models it is analysed with, the tenant that hosts those models, and the
//! nested field template whose vocabulary downstream consumers rely on.
//! Definitions are embedded at build time and can be replaced at startup
//! from a directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::info;

/// Key wrapping the template in extraction output.
pub const TEMPLATE_ROOT: &str = "Root";

/// Delimiter for nested field paths.
pub const PATH_DELIMITER: char = '|';

const BUILTIN_FORMS: [(&str, &str); 4] = [
    ("form1.json", include_str!("../configs/forms/form1.json")),
    ("form2.json", include_str!("../configs/forms/form2.json")),
    ("form3.json", include_str!("../configs/forms/form3.json")),
    ("form4.json", include_str!("../configs/forms/form4.json")),
];

/// Supported form identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FormId {
    ChannelRequest = 1,
    AccountOpening = 2,
    PayrollAccountOpening = 3,
    VoterRoster = 4,
}

impl FormId {
    pub const ALL: [FormId; 4] = [
        FormId::ChannelRequest,
        FormId::AccountOpening,
        FormId::PayrollAccountOpening,
        FormId::VoterRoster,
    ];

    pub fn number(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FormId {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(FormId::ChannelRequest),
            2 => Ok(FormId::AccountOpening),
            3 => Ok(FormId::PayrollAccountOpening),
            4 => Ok(FormId::VoterRoster),
            other => Err(format!("Unknown form number: {} (expected 1-4)", other)),
        }
    }
}

impl From<FormId> for u8 {
    fn from(id: FormId) -> Self {
        id.number()
    }
}

impl std::str::FromStr for FormId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let n: u8 = s
            .trim()
            .parse()
            .map_err(|_| format!("Form number must be an integer, got {:?}", s))?;
        FormId::try_from(n)
    }
}

impl fmt::Display for FormId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "form {}", self.number())
    }
}

/// Which analysis-service resource hosts a form's models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tenant {
    Primary,
    Secondary,
}

/// Model identifiers per analysis pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormModels {
    /// Neural model used for field extraction.
    pub extraction: String,
    /// Template model used to locate the signature region.
    pub signature: String,
}

/// One form's definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormDefinition {
    pub form_id: FormId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tenant: Tenant,
    pub models: FormModels,
    /// Nested field tree: objects are groups, empty arrays are leaves.
    pub template: Map<String, Value>,
}

impl FormDefinition {
    /// The shape extraction output starts from: `{"Root": template}`.
    pub fn initial_output(&self) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert(
            TEMPLATE_ROOT.to_string(),
            Value::Object(self.template.clone()),
        );
        out
    }

    /// Flat vocabulary: every leaf path joined with `|`, in template order.
    pub fn field_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_leaf_paths(&self.template, "", &mut names);
        names
    }
}

fn collect_leaf_paths(node: &Map<String, Value>, prefix: &str, out: &mut Vec<String>) {
    for (key, value) in node {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}{}{}", prefix, PATH_DELIMITER, key)
        };
        match value {
            Value::Object(children) if !children.is_empty() => {
                collect_leaf_paths(children, &path, out)
            }
            _ => out.push(path),
        }
    }
}

/// Immutable set of the four form definitions.
#[derive(Debug)]
pub struct FormRegistry {
    forms: BTreeMap<FormId, FormDefinition>,
}

impl FormRegistry {
    /// Definitions compiled into the binary.
    pub fn builtin() -> Result<Self> {
        let mut forms = Vec::with_capacity(BUILTIN_FORMS.len());
        for (file, content) in BUILTIN_FORMS {
            let form: FormDefinition = serde_json::from_str(content)
                .with_context(|| format!("Failed to parse built-in form definition {}", file))?;
            forms.push(form);
        }
        Self::from_forms(forms)
    }

    /// Load every `*.json` definition from a directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            anyhow::bail!("Form directory does not exist: {:?}", dir);
        }

        let mut forms = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read form definition: {:?}", path))?;

                let form: FormDefinition = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse form definition: {:?}", path))?;

                info!("Loaded {} ({}) from {:?}", form.form_id, form.name, path);
                forms.push(form);
            }
        }

        Self::from_forms(forms)
    }

    fn from_forms(forms: Vec<FormDefinition>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for form in forms {
            let id = form.form_id;
            if map.insert(id, form).is_some() {
                anyhow::bail!("Duplicate definition for {}", id);
            }
        }

        for id in FormId::ALL {
            if !map.contains_key(&id) {
                anyhow::bail!("Missing definition for {}", id);
            }
        }

        Ok(Self { forms: map })
    }

    pub fn get(&self, id: FormId) -> &FormDefinition {
        // from_forms guarantees every FormId is present
        &self.forms[&id]
    }

    pub fn iter(&self) -> impl Iterator<Item = &FormDefinition> {
        self.forms.values()
    }
}
