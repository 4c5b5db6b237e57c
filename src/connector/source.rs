//! Source definitions.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;

use super::compute::Compute;
use super::lenient;

fn default_list_separator() -> String {
    "\n".to_string()
}

/// HTTP method for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Head,
    Put,
    Delete,
    Options,
    Patch,
}

impl HttpMethod {
    /// Get the method name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Head => "HEAD",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
        }
    }
}

/// Which part of an HTTP response becomes the source result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultContent {
    #[default]
    Body,
    Header,
    HttpStatus,
    All,
}

/// How per-row results of `executeForEachEntryOf` are folded together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryConcatMethod {
    /// Raw results joined with the declared separator.
    #[default]
    List,
    /// `[R1,R2,...]`
    JsonArray,
    /// `[{"row":[...],"result":R1},...]`
    JsonArrayExtended,
    /// Each result wrapped in `concatStart` / `concatEnd`.
    Custom,
}

/// Row-wise iteration over another source's table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteForEachEntryOf {
    /// Key (or `${source::KEY}`) of the iterated source.
    pub source: String,

    #[serde(default)]
    pub concat_method: EntryConcatMethod,

    /// Separator of the `list` method.
    #[serde(default = "default_list_separator")]
    pub separator: String,

    #[serde(default)]
    pub concat_start: String,

    #[serde(default)]
    pub concat_end: String,
}

impl ExecuteForEachEntryOf {
    pub fn new(source: impl Into<String>, concat_method: EntryConcatMethod) -> Self {
        Self {
            source: source.into(),
            concat_method,
            separator: default_list_separator(),
            concat_start: String::new(),
            concat_end: String::new(),
        }
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn with_custom_bounds(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.concat_start = start.into();
        self.concat_end = end.into();
        self
    }
}

/// Typed source parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, AsRefStr)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SourceKind {
    SnmpGet {
        oid: String,
    },
    SnmpTable {
        oid: String,
        #[serde(default)]
        select_columns: Vec<String>,
    },
    Wbem {
        query: String,
        #[serde(default)]
        namespace: Option<String>,
    },
    Wmi {
        query: String,
        #[serde(default)]
        namespace: Option<String>,
    },
    Http {
        #[serde(default)]
        method: HttpMethod,
        /// Absolute URL or path relative to the host.
        url: String,
        #[serde(default)]
        header: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        authentication_token: Option<String>,
        #[serde(default)]
        result_content: ResultContent,
    },
    OsCommand {
        command_line: String,
        #[serde(default)]
        execute_locally: bool,
        #[serde(default, with = "humantime_serde")]
        timeout: Option<Duration>,
        #[serde(default)]
        exclude_regexp: Option<String>,
        #[serde(default)]
        keep_only_regexp: Option<String>,
        #[serde(default)]
        remove_header: usize,
        #[serde(default)]
        remove_footer: usize,
        #[serde(default)]
        separators: Option<String>,
        #[serde(default)]
        select_columns: Option<String>,
    },
    Ipmi,
    /// Inline `;`-separated table.
    Static {
        #[serde(deserialize_with = "lenient::string")]
        value: String,
    },
    TableJoin {
        left_table: String,
        right_table: String,
        left_key_column: usize,
        right_key_column: usize,
        #[serde(default)]
        default_right_line: Option<String>,
        #[serde(default)]
        case_sensitive: bool,
    },
    TableUnion {
        tables: Vec<String>,
    },
    Copy {
        from: String,
    },
}

impl SourceKind {
    /// Whether the source is answered without any protocol call.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Static { .. } | Self::TableJoin { .. } | Self::TableUnion { .. } | Self::Copy { .. }
        )
    }

    /// Source keys consumed directly as tables.
    pub fn table_references(&self) -> Vec<&str> {
        match self {
            Self::TableJoin {
                left_table,
                right_table,
                ..
            } => vec![source_ref(left_table), source_ref(right_table)],
            Self::TableUnion { tables } => tables.iter().map(|t| source_ref(t)).collect(),
            Self::Copy { from } => vec![source_ref(from)],
            _ => Vec::new(),
        }
    }

    /// Every free-text parameter, for reference scanning.
    pub fn params(&self) -> Vec<&str> {
        let mut params = Vec::new();
        match self {
            Self::SnmpGet { oid } => params.push(oid.as_str()),
            Self::SnmpTable {
                oid,
                select_columns,
            } => {
                params.push(oid.as_str());
                params.extend(select_columns.iter().map(String::as_str));
            }
            Self::Wbem { query, namespace } | Self::Wmi { query, namespace } => {
                params.push(query.as_str());
                params.extend(namespace.as_deref());
            }
            Self::Http {
                url,
                header,
                body,
                authentication_token,
                ..
            } => {
                params.push(url.as_str());
                params.extend(header.values().map(String::as_str));
                params.extend(body.as_deref());
                params.extend(authentication_token.as_deref());
            }
            Self::OsCommand {
                command_line,
                exclude_regexp,
                keep_only_regexp,
                ..
            } => {
                params.push(command_line.as_str());
                params.extend(exclude_regexp.as_deref());
                params.extend(keep_only_regexp.as_deref());
            }
            Self::Static { value } => params.push(value.as_str()),
            Self::TableJoin {
                default_right_line,
                ..
            } => params.extend(default_right_line.as_deref()),
            Self::Ipmi | Self::TableUnion { .. } | Self::Copy { .. } => {}
        }
        params
    }

    /// Mutable view of every free-text parameter, for substitution.
    pub fn params_mut(&mut self) -> Vec<&mut String> {
        let mut params = Vec::new();
        match self {
            Self::SnmpGet { oid } => params.push(oid),
            Self::SnmpTable {
                oid,
                select_columns,
            } => {
                params.push(oid);
                params.extend(select_columns.iter_mut());
            }
            Self::Wbem { query, namespace } | Self::Wmi { query, namespace } => {
                params.push(query);
                params.extend(namespace.as_mut());
            }
            Self::Http {
                url,
                header,
                body,
                authentication_token,
                ..
            } => {
                params.push(url);
                params.extend(header.values_mut());
                params.extend(body.as_mut());
                params.extend(authentication_token.as_mut());
            }
            Self::OsCommand {
                command_line,
                exclude_regexp,
                keep_only_regexp,
                ..
            } => {
                params.push(command_line);
                params.extend(exclude_regexp.as_mut());
                params.extend(keep_only_regexp.as_mut());
            }
            Self::Static { value } => params.push(value),
            Self::TableJoin {
                default_right_line,
                ..
            } => params.extend(default_right_line.as_mut()),
            Self::Ipmi | Self::TableUnion { .. } | Self::Copy { .. } => {}
        }
        params
    }

    /// Clone with `f` applied to every free-text parameter.
    #[must_use]
    pub fn substituted(&self, f: &dyn Fn(&str) -> String) -> Self {
        let mut kind = self.clone();
        for param in kind.params_mut() {
            *param = f(param);
        }
        kind
    }
}

/// A named data-acquisition step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Unique key within the connector.
    pub key: String,

    #[serde(flatten)]
    pub kind: SourceKind,

    #[serde(default)]
    pub computes: Vec<Compute>,

    /// Must never run concurrently with another serialized operation on the host.
    #[serde(default)]
    pub force_serialization: bool,

    #[serde(default)]
    pub execute_for_each_entry_of: Option<ExecuteForEachEntryOf>,
}

impl Source {
    pub fn new(key: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            key: key.into(),
            kind,
            computes: Vec::new(),
            force_serialization: false,
            execute_for_each_entry_of: None,
        }
    }

    pub fn with_computes(mut self, computes: Vec<Compute>) -> Self {
        self.computes = computes;
        self
    }

    pub fn with_force_serialization(mut self, force: bool) -> Self {
        self.force_serialization = force;
        self
    }

    pub fn with_for_each(mut self, for_each: ExecuteForEachEntryOf) -> Self {
        self.execute_for_each_entry_of = Some(for_each);
        self
    }

    /// Keys of every source this one depends on, deduplicated, in first-seen order.
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = Vec::new();
        let mut push = |key: &str| {
            if !key.is_empty() && !deps.iter().any(|d| d == key) {
                deps.push(key.to_string());
            }
        };

        if let Some(for_each) = &self.execute_for_each_entry_of {
            push(source_ref(&for_each.source));
        }
        for key in self.kind.table_references() {
            push(key);
        }
        for param in self.kind.params() {
            for key in referenced_sources(param) {
                push(key);
            }
        }
        for compute in &self.computes {
            for param in compute.params() {
                for key in referenced_sources(param) {
                    push(key);
                }
            }
        }
        deps
    }

    /// Apply `f` to every parameter of the source and of its computes.
    pub fn substitute_in_place(&mut self, f: &dyn Fn(&str) -> String) {
        for param in self.kind.params_mut() {
            *param = f(param);
        }
        for compute in &mut self.computes {
            for param in compute.params_mut() {
                *param = f(param);
            }
        }
    }

    /// Clone with `f` applied to every parameter of the source and its computes.
    #[must_use]
    pub fn substituted(&self, f: &dyn Fn(&str) -> String) -> Self {
        let mut source = self.clone();
        source.substitute_in_place(f);
        source
    }
}

fn source_ref_regex() -> &'static regex::Regex {
    static SOURCE_REF_REGEX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    SOURCE_REF_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{source::([^}]+)\}").expect("failed to compile source ref regex")
    })
}

/// Normalize a table reference: `${source::KEY}` and `KEY` both yield `KEY`.
pub fn source_ref(reference: &str) -> &str {
    let trimmed = reference.trim();
    trimmed
        .strip_prefix("${source::")
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(trimmed)
}

/// Source keys referenced as `${source::KEY}` inside free text.
pub fn referenced_sources(text: &str) -> impl Iterator<Item = &str> {
    source_ref_regex()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim()))
}

/// Replace each `${source::KEY}` in `text` using `lookup`; unknown keys are left as is.
pub(crate) fn replace_source_refs(text: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    source_ref_regex()
        .replace_all(text, |caps: &regex::Captures| {
            lookup(caps[1].trim()).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
