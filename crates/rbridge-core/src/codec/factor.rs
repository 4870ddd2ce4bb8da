//! Factor construction from host strings.

use rustc_hash::FxHashMap;

use crate::value::{EngineValue, INTEGER_NA};

/// Encode strings as a factor.
///
/// Levels are assigned in a single left-to-right pass: each distinct string
/// gets the next level id the first time it is seen. Missing elements never
/// enter the level table and are encoded as [`INTEGER_NA`].
pub fn build_factor<'a, I>(values: I) -> EngineValue
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut ids: FxHashMap<&'a str, i32> = FxHashMap::default();
    let mut levels = Vec::new();
    let mut indices = Vec::new();

    for value in values {
        let code = match value {
            None => INTEGER_NA,
            Some(s) => *ids.entry(s).or_insert_with(|| {
                levels.push(s.to_string());
                levels.len() as i32
            }),
        };
        indices.push(code);
    }

    EngineValue::Factor { indices, levels }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_occurrence_order() {
        let factor = build_factor(["b", "a", "b", "c"].into_iter().map(Some));
        assert_eq!(
            factor,
            EngineValue::Factor {
                indices: vec![1, 2, 1, 3],
                levels: vec!["b".into(), "a".into(), "c".into()],
            }
        );
    }

    #[test]
    fn test_missing_never_becomes_a_level() {
        let factor = build_factor(vec![None, Some("x"), None, Some("x")]);
        assert_eq!(
            factor,
            EngineValue::Factor {
                indices: vec![INTEGER_NA, 1, INTEGER_NA, 1],
                levels: vec!["x".into()],
            }
        );
    }

    #[test]
    fn test_empty_input() {
        let factor = build_factor(Vec::<Option<&str>>::new());
        assert_eq!(
            factor,
            EngineValue::Factor {
                indices: vec![],
                levels: vec![],
            }
        );
    }
}
