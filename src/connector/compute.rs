//! Compute definitions.
//!
//! Columns are 1-based. Operands documented as "value" may be a literal, a
//! column reference (`$N` or `Column(N)`) or, for numeric computes, a number.

use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;

use super::lenient;

fn default_array_separator() -> String {
    "|".to_string()
}

fn default_json_separator() -> String {
    ";".to_string()
}

/// Conversion applied by [`Compute::Convert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Conversion {
    /// Hexadecimal string to decimal.
    Hex2Dec,
    /// `|`-separated status list to the worst of `OK`, `WARN`, `ALARM`.
    Array2SimpleStatus,
}

/// A table transformation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, AsRefStr)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Compute {
    Add {
        column: usize,
        #[serde(deserialize_with = "lenient::string")]
        value: String,
    },
    Subtract {
        column: usize,
        #[serde(deserialize_with = "lenient::string")]
        value: String,
    },
    Multiply {
        column: usize,
        #[serde(deserialize_with = "lenient::string")]
        value: String,
    },
    Divide {
        column: usize,
        #[serde(deserialize_with = "lenient::string")]
        value: String,
    },
    /// Bitwise and.
    And {
        column: usize,
        #[serde(deserialize_with = "lenient::string")]
        value: String,
    },
    DuplicateColumn {
        column: usize,
    },
    KeepColumns {
        column_numbers: Vec<usize>,
    },
    #[serde(alias = "keepOnlyRegExp")]
    KeepOnlyMatchingLines {
        column: usize,
        #[serde(default)]
        regexp: Option<String>,
        #[serde(default)]
        value_list: Vec<String>,
    },
    #[serde(alias = "excludeRegExp")]
    ExcludeMatchingLines {
        column: usize,
        #[serde(default)]
        regexp: Option<String>,
        #[serde(default)]
        value_list: Vec<String>,
    },
    Replace {
        column: usize,
        #[serde(deserialize_with = "lenient::string")]
        existing_value: String,
        #[serde(deserialize_with = "lenient::string")]
        new_value: String,
        /// Treat `existing_value` as a regular expression.
        #[serde(default)]
        regex: bool,
    },
    Substring {
        column: usize,
        #[serde(deserialize_with = "lenient::string")]
        start: String,
        #[serde(deserialize_with = "lenient::string")]
        length: String,
    },
    LeftConcat {
        column: usize,
        #[serde(deserialize_with = "lenient::string")]
        value: String,
    },
    RightConcat {
        column: usize,
        #[serde(deserialize_with = "lenient::string")]
        value: String,
    },
    Convert {
        column: usize,
        conversion: Conversion,
    },
    Translate {
        column: usize,
        translation_table: String,
    },
    ArrayTranslate {
        column: usize,
        translation_table: String,
        #[serde(default = "default_array_separator")]
        array_separator: String,
        #[serde(default = "default_array_separator")]
        result_separator: String,
    },
    #[serde(alias = "perBitTranslate")]
    PerBitTranslation {
        column: usize,
        bit_list: Vec<u32>,
        translation_table: String,
    },
    Extract {
        column: usize,
        sub_column: usize,
        sub_separators: String,
    },
    ExtractPropertyFromWbemPath {
        column: usize,
        property: String,
    },
    Json2Csv {
        entry_key: String,
        #[serde(default)]
        properties: Vec<String>,
        #[serde(default = "default_json_separator")]
        separator: String,
    },
    Awk {
        script: String,
        #[serde(default)]
        exclude_regexp: Option<String>,
        #[serde(default)]
        keep_only_regexp: Option<String>,
        #[serde(default)]
        separators: Option<String>,
        #[serde(default)]
        select_columns: Option<String>,
    },
}

impl Compute {
    /// Translation table referenced by this compute, if any.
    pub fn translation_table(&self) -> Option<&str> {
        match self {
            Self::Translate {
                translation_table, ..
            }
            | Self::ArrayTranslate {
                translation_table, ..
            }
            | Self::PerBitTranslation {
                translation_table, ..
            } => Some(translation_table),
            _ => None,
        }
    }

    /// Free-text parameters, for reference scanning.
    pub fn params(&self) -> Vec<&str> {
        let mut params = Vec::new();
        match self {
            Self::Add { value, .. }
            | Self::Subtract { value, .. }
            | Self::Multiply { value, .. }
            | Self::Divide { value, .. }
            | Self::And { value, .. }
            | Self::LeftConcat { value, .. }
            | Self::RightConcat { value, .. } => params.push(value.as_str()),
            Self::Replace {
                existing_value,
                new_value,
                ..
            } => {
                params.push(existing_value.as_str());
                params.push(new_value.as_str());
            }
            Self::KeepOnlyMatchingLines {
                regexp, value_list, ..
            }
            | Self::ExcludeMatchingLines {
                regexp, value_list, ..
            } => {
                params.extend(regexp.as_deref());
                params.extend(value_list.iter().map(String::as_str));
            }
            Self::Awk {
                script,
                exclude_regexp,
                keep_only_regexp,
                ..
            } => {
                params.push(script.as_str());
                params.extend(exclude_regexp.as_deref());
                params.extend(keep_only_regexp.as_deref());
            }
            _ => {}
        }
        params
    }

    /// Mutable view of the free-text parameters, for substitution.
    pub fn params_mut(&mut self) -> Vec<&mut String> {
        let mut params = Vec::new();
        match self {
            Self::Add { value, .. }
            | Self::Subtract { value, .. }
            | Self::Multiply { value, .. }
            | Self::Divide { value, .. }
            | Self::And { value, .. }
            | Self::LeftConcat { value, .. }
            | Self::RightConcat { value, .. } => params.push(value),
            Self::Replace {
                existing_value,
                new_value,
                ..
            } => {
                params.push(existing_value);
                params.push(new_value);
            }
            Self::KeepOnlyMatchingLines {
                regexp, value_list, ..
            }
            | Self::ExcludeMatchingLines {
                regexp, value_list, ..
            } => {
                params.extend(regexp.as_mut());
                params.extend(value_list.iter_mut());
            }
            Self::Awk {
                script,
                exclude_regexp,
                keep_only_regexp,
                ..
            } => {
                params.push(script);
                params.extend(exclude_regexp.as_mut());
                params.extend(keep_only_regexp.as_mut());
            }
            _ => {}
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numeric_operand_as_string() {
        let compute: Compute = serde_yaml::from_str("type: multiply\ncolumn: 2\nvalue: 1024").unwrap();
        assert_eq!(
            compute,
            Compute::Multiply {
                column: 2,
                value: "1024".into()
            }
        );
        assert_eq!(compute.as_ref(), "Multiply");
    }

    #[test]
    fn test_parse_filter_aliases() {
        let compute: Compute =
            serde_yaml::from_str("type: keepOnlyRegExp\ncolumn: 1\nregexp: ^OK").unwrap();
        assert!(matches!(
            compute,
            Compute::KeepOnlyMatchingLines { column: 1, ref regexp, .. } if regexp.as_deref() == Some("^OK")
        ));
    }

    #[test]
    fn test_array_translate_defaults() {
        let compute: Compute = serde_yaml::from_str(
            "type: arrayTranslate\ncolumn: 3\ntranslationTable: states",
        )
        .unwrap();
        match compute {
            Compute::ArrayTranslate {
                array_separator,
                result_separator,
                ..
            } => {
                assert_eq!(array_separator, "|");
                assert_eq!(result_separator, "|");
            }
            other => panic!("unexpected compute {other:?}"),
        }
        assert_eq!(
            serde_yaml::from_str::<Compute>(
                "type: perBitTranslation\ncolumn: 1\nbitList: [0, 1]\ntranslationTable: bits"
            )
            .unwrap()
            .translation_table(),
            Some("bits")
        );
    }
}
