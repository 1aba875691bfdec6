use serde_json::{Map, Value};

use crate::util::non_null;

/// Closed set of shapes that appear inside the JSON-encoded columns.
#[derive(Debug, Clone, PartialEq)]
pub enum NestedEntity {
    Genre {
        id: i64,
        name: String,
    },
    Company {
        id: i64,
        name: String,
    },
    Collection {
        id: i64,
        name: String,
    },
    CastMember {
        person_id: i64,
        name: String,
        character: Option<String>,
        order: Option<i64>,
        credit_id: Option<String>,
    },
    CrewMember {
        person_id: i64,
        name: String,
        department: Option<String>,
        job: Option<String>,
        credit_id: Option<String>,
    },
    Keyword {
        id: i64,
        name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestedShape {
    Genre,
    Company,
    Collection,
    CastMember,
    CrewMember,
    Keyword,
}

/// Result of decoding one array column: the entities that made it plus the
/// number of elements that had no usable id.
#[derive(Debug, Default)]
pub struct DecodedList {
    pub entities: Vec<NestedEntity>,
    pub dropped: usize,
}

/// Strict JSON first, then the Python-literal dialect (`'quoted'`, `None`,
/// `True`) the source exports are written in. Anything else is `None`.
pub fn tolerant_parse(raw: &str) -> Option<Value> {
    let mut value = non_null(raw)?;
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value = &value[1..value.len() - 1];
    }

    if let Ok(parsed) = serde_json::from_str::<Value>(value) {
        return Some(parsed);
    }

    let converted = python_literal_to_json(value)?;
    serde_json::from_str::<Value>(&converted).ok()
}

pub fn decode_list(raw: Option<&str>, shape: NestedShape) -> DecodedList {
    let mut decoded = DecodedList::default();
    let objects: Vec<Map<String, Value>> = match raw.and_then(tolerant_parse) {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(object) => Some(object),
                _ => {
                    decoded.dropped += 1;
                    None
                }
            })
            .collect(),
        Some(Value::Object(object)) => vec![object],
        _ => Vec::new(),
    };

    for object in &objects {
        match entity_from_object(shape, object) {
            Some(entity) => decoded.entities.push(entity),
            None => decoded.dropped += 1,
        }
    }
    decoded
}

pub fn decode_single(raw: Option<&str>, shape: NestedShape) -> Option<NestedEntity> {
    match raw.and_then(tolerant_parse)? {
        Value::Object(object) => entity_from_object(shape, &object),
        _ => None,
    }
}

/// Re-serializes a nested column into canonical JSON text for columns that
/// are stored as documents rather than exploded into rows.
pub fn canonical_json(raw: Option<&str>) -> Option<String> {
    match raw.and_then(tolerant_parse)? {
        Value::Null => None,
        value => Some(value.to_string()),
    }
}

fn entity_from_object(shape: NestedShape, object: &Map<String, Value>) -> Option<NestedEntity> {
    let id = integer_field(object, "id")?;
    let name = string_field(object, "name").unwrap_or_default();

    let entity = match shape {
        NestedShape::Genre => NestedEntity::Genre { id, name },
        NestedShape::Company => NestedEntity::Company { id, name },
        NestedShape::Collection => NestedEntity::Collection { id, name },
        NestedShape::Keyword => NestedEntity::Keyword { id, name },
        NestedShape::CastMember => NestedEntity::CastMember {
            person_id: id,
            name,
            character: string_field(object, "character"),
            order: integer_field(object, "order"),
            credit_id: string_field(object, "credit_id"),
        },
        NestedShape::CrewMember => NestedEntity::CrewMember {
            person_id: id,
            name,
            department: string_field(object, "department"),
            job: string_field(object, "job"),
            credit_id: string_field(object, "credit_id"),
        },
    };
    Some(entity)
}

fn integer_field(object: &Map<String, Value>, key: &str) -> Option<i64> {
    match object.get(key)? {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|value| value.fract() == 0.0)
                .map(|value| value as i64)
        }),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn python_literal_to_json(input: &str) -> Option<String> {
    let mut out = String::with_capacity(input.len() + 16);
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' | '"' => {
                out.push('"');
                let quote = ch;
                let mut closed = false;
                while let Some(inner) = chars.next() {
                    match inner {
                        '\\' => match chars.next()? {
                            '\'' => out.push('\''),
                            '"' => out.push_str("\\\""),
                            escaped => {
                                out.push('\\');
                                out.push(escaped);
                            }
                        },
                        c if c == quote => {
                            closed = true;
                            break;
                        }
                        '"' => out.push_str("\\\""),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        '\t' => out.push_str("\\t"),
                        c => out.push(c),
                    }
                }
                if !closed {
                    return None;
                }
                out.push('"');
            }
            c if c.is_ascii_alphabetic() => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.as_str() {
                    "None" | "nan" | "NaN" => out.push_str("null"),
                    "True" => out.push_str("true"),
                    "False" => out.push_str("false"),
                    _ => return None,
                }
            }
            c => out.push(c),
        }
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_literal_lists_decode_into_genres() {
        let raw = "[{'id': 16, 'name': 'Animation'}, {'id': 35, 'name': 'Comedy'}]";
        let decoded = decode_list(Some(raw), NestedShape::Genre);

        assert_eq!(decoded.dropped, 0);
        assert_eq!(
            decoded.entities,
            vec![
                NestedEntity::Genre {
                    id: 16,
                    name: "Animation".to_string()
                },
                NestedEntity::Genre {
                    id: 35,
                    name: "Comedy".to_string()
                },
            ]
        );
    }

    #[test]
    fn strict_json_is_accepted_as_is() {
        let decoded = decode_list(Some(r#"[{"id":1,"name":"Drama"}]"#), NestedShape::Genre);
        assert_eq!(decoded.entities.len(), 1);
    }

    #[test]
    fn empty_markers_and_garbage_yield_empty_lists() {
        for raw in ["", "nan", "None", "[{'id': 16, 'name': ", "not json at all", "42"] {
            let decoded = decode_list(Some(raw), NestedShape::Genre);
            assert!(decoded.entities.is_empty(), "expected no genres for {raw:?}");
        }
        assert!(decode_list(None, NestedShape::Genre).entities.is_empty());
    }

    #[test]
    fn quotes_inside_single_quoted_strings_survive() {
        let raw = r#"[{'cast_id': 1, 'character': 'Woody "the cowboy"', 'credit_id': '52fe4284c3a36847f8024f95', 'id': 31, 'name': 'Tom Hanks', 'order': 0}]"#;
        let decoded = decode_list(Some(raw), NestedShape::CastMember);

        assert_eq!(
            decoded.entities,
            vec![NestedEntity::CastMember {
                person_id: 31,
                name: "Tom Hanks".to_string(),
                character: Some("Woody \"the cowboy\"".to_string()),
                order: Some(0),
                credit_id: Some("52fe4284c3a36847f8024f95".to_string()),
            }]
        );
    }

    #[test]
    fn double_quoted_names_with_apostrophes_decode() {
        let raw = r#"[{'id': 9, 'name': "Ol' Dirty", 'department': 'Sound', 'job': 'Music', 'profile_path': None}]"#;
        let decoded = decode_list(Some(raw), NestedShape::CrewMember);

        assert_eq!(decoded.entities.len(), 1);
        match &decoded.entities[0] {
            NestedEntity::CrewMember { name, job, .. } => {
                assert_eq!(name, "Ol' Dirty");
                assert_eq!(job.as_deref(), Some("Music"));
            }
            other => panic!("unexpected entity {other:?}"),
        }
    }

    #[test]
    fn elements_without_ids_are_counted_not_kept() {
        let raw = "[{'name': 'Nameless'}, {'id': 'x', 'name': 'Bad'}, {'id': 7, 'name': 'Ok'}, 3]";
        let decoded = decode_list(Some(raw), NestedShape::Keyword);

        assert_eq!(decoded.entities.len(), 1);
        assert_eq!(decoded.dropped, 3);
    }

    #[test]
    fn single_object_columns_decode_to_one_entity() {
        let raw = "{'id': 10194, 'name': 'Toy Story Collection', 'poster_path': '/7G9915LfUQ2lVfwMEEhDsn3kT4B.jpg', 'backdrop_path': None}";
        assert_eq!(
            decode_single(Some(raw), NestedShape::Collection),
            Some(NestedEntity::Collection {
                id: 10194,
                name: "Toy Story Collection".to_string()
            })
        );
        assert_eq!(decode_single(Some("nan"), NestedShape::Collection), None);
        assert_eq!(decode_single(Some("[]"), NestedShape::Collection), None);
    }

    #[test]
    fn canonical_json_rewrites_python_literals() {
        let raw = "[{'iso_3166_1': 'US', 'name': 'United States of America'}]";
        assert_eq!(
            canonical_json(Some(raw)).as_deref(),
            Some(r#"[{"iso_3166_1":"US","name":"United States of America"}]"#)
        );
        assert_eq!(canonical_json(Some("")), None);
    }
}
