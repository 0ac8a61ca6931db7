//! Short, collision-free codes for free-text descriptions.
//!
//! Codes already present in a caller's mapping are reused verbatim. New
//! descriptions start from a deterministic guess built from their own
//! characters and only fall back to random generation when the guess is
//! taken. The random source is injected so runs are reproducible.
//!
//! Termination relies on `36^code_length` being much larger than the
//! number of distinct descriptions; the loop does not check this.
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Description → code.
pub type CodeMap = BTreeMap<String, String>;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const PARETO_SHAPE: f64 = 1.16;
const ATTEMPTS_PER_STAGE: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeOptions {
    pub code_length: usize,
    pub case_sensitive: bool,
}

impl Default for CodeOptions {
    fn default() -> Self {
        Self {
            code_length: 3,
            case_sensitive: false,
        }
    }
}

/// Case-fold used to match descriptions when `case_sensitive` is off.
pub fn fold(description: &str) -> String {
    description.to_lowercase()
}

fn code_chars(description: &str) -> Vec<char> {
    description
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Deterministic first guess: uppercased alphanumerics cycled to length.
pub fn initial_guess(description: &str, code_length: usize) -> Option<String> {
    let chars = code_chars(description);
    if chars.is_empty() {
        return None;
    }
    Some(chars.iter().cycle().take(code_length).collect())
}

/// Escalating candidate generator for a description whose guess collided.
fn regenerate<R: Rng + ?Sized>(
    chars: &[char],
    code_length: usize,
    attempt: u32,
    rng: &mut R,
) -> String {
    let stage = if chars.is_empty() {
        2
    } else {
        (attempt.saturating_sub(1) / ATTEMPTS_PER_STAGE).min(2)
    };
    match stage {
        // Early positions of the description are favoured.
        0 => {
            let weights: Vec<f64> = (0..chars.len())
                .map(|i| PARETO_SHAPE / ((i + 1) as f64).powf(PARETO_SHAPE + 1.0))
                .collect();
            match WeightedIndex::new(&weights) {
                Ok(dist) => (0..code_length).map(|_| chars[dist.sample(rng)]).collect(),
                Err(_) => full_alphabet(code_length, rng),
            }
        }
        1 => {
            let distinct: Vec<char> = chars
                .iter()
                .copied()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            (0..code_length)
                .map(|_| distinct[rng.gen_range(0..distinct.len())])
                .collect()
        }
        _ => full_alphabet(code_length, rng),
    }
}

fn full_alphabet<R: Rng + ?Sized>(code_length: usize, rng: &mut R) -> String {
    (0..code_length)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

struct Pending {
    members: Vec<String>,
    chars: Vec<char>,
    candidate: String,
    attempt: u32,
}

/// Assign a unique code to every description.
///
/// Exact matches in `existing` win, then (case-insensitive mode only)
/// folded matches. Remaining descriptions get fresh codes that collide with
/// nothing in `existing` and nothing assigned in this call. The returned
/// map covers exactly `descriptions`.
pub fn synthesize_codes<R: Rng + ?Sized>(
    descriptions: &BTreeSet<String>,
    existing: &CodeMap,
    options: &CodeOptions,
    rng: &mut R,
) -> CodeMap {
    let mut folded_existing: HashMap<String, &String> = HashMap::new();
    if !options.case_sensitive {
        for (description, code) in existing {
            folded_existing.entry(fold(description)).or_insert(code);
        }
    }

    let mut resolved = CodeMap::new();
    let mut unresolved: Vec<&String> = Vec::new();
    for description in descriptions {
        if let Some(code) = existing.get(description) {
            resolved.insert(description.clone(), code.clone());
        } else if let Some(code) = folded_existing.get(&fold(description)) {
            resolved.insert(description.clone(), (*code).clone());
        } else {
            unresolved.push(description);
        }
    }

    let mut used: HashSet<String> = existing.values().cloned().collect();
    used.extend(resolved.values().cloned());

    // One pending entry per code to mint; case variants share one entry.
    let mut pending: Vec<Pending> = Vec::new();
    let mut by_fold: HashMap<String, usize> = HashMap::new();
    for description in unresolved {
        let key = if options.case_sensitive {
            description.clone()
        } else {
            fold(description)
        };
        if let Some(&slot) = by_fold.get(&key) {
            pending[slot].members.push(description.clone());
            continue;
        }
        by_fold.insert(key, pending.len());
        let chars = code_chars(description);
        let candidate = initial_guess(description, options.code_length)
            .unwrap_or_else(|| full_alphabet(options.code_length, rng));
        pending.push(Pending {
            members: vec![description.clone()],
            chars,
            candidate,
            attempt: 0,
        });
    }

    let mut round = 0u32;
    while !pending.is_empty() {
        let mut collided = Vec::new();
        for mut entry in pending {
            if used.insert(entry.candidate.clone()) {
                for member in entry.members {
                    resolved.insert(member, entry.candidate.clone());
                }
            } else {
                entry.attempt += 1;
                entry.candidate =
                    regenerate(&entry.chars, options.code_length, entry.attempt, rng);
                collided.push(entry);
            }
        }
        if !collided.is_empty() {
            round += 1;
            debug!(round, collisions = collided.len(), "regenerating colliding codes");
        }
        pending = collided;
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_initial_guess_cycles_and_truncates() {
        assert_eq!(initial_guess("tv", 3).unwrap(), "TVT");
        assert_eq!(initial_guess("Paid Search", 3).unwrap(), "PAI");
        assert_eq!(initial_guess("--", 3), None);
    }

    #[test]
    fn test_case_variants_share_code() {
        let codes = synthesize_codes(
            &set(&["GRP", "GRp", "gRP"]),
            &CodeMap::new(),
            &CodeOptions::default(),
            &mut rng(),
        );
        assert_eq!(codes.len(), 3);
        assert_eq!(codes["GRP"], codes["GRp"]);
        assert_eq!(codes["GRP"], codes["gRP"]);
    }

    #[test]
    fn test_case_sensitive_codes_are_unique() {
        let options = CodeOptions {
            code_length: 3,
            case_sensitive: true,
        };
        let descriptions = set(&["GRP", "GRp", "gRP", "grp", "Gross Rating", "GR", "G R P"]);
        let codes = synthesize_codes(&descriptions, &CodeMap::new(), &options, &mut rng());
        let unique: HashSet<&String> = codes.values().collect();
        assert_eq!(unique.len(), descriptions.len());
        assert!(codes.values().all(|c| c.len() == 3));
    }

    #[test]
    fn test_existing_mapping_is_stable() {
        let options = CodeOptions {
            code_length: 3,
            case_sensitive: true,
        };
        let first = synthesize_codes(
            &set(&["TV", "Radio", "Print"]),
            &CodeMap::new(),
            &options,
            &mut rng(),
        );
        let mut other = StdRng::seed_from_u64(99);
        let second = synthesize_codes(
            &set(&["TV", "Radio", "Print", "Tv Spot"]),
            &first,
            &options,
            &mut other,
        );
        for (description, code) in &first {
            assert_eq!(&second[description], code);
        }
        assert!(!first.values().any(|c| c == &second["Tv Spot"]));
    }

    #[test]
    fn test_exact_match_beats_folded_match() {
        let mut existing = CodeMap::new();
        existing.insert("tv".to_string(), "AAA".to_string());
        existing.insert("TV".to_string(), "BBB".to_string());
        let codes = synthesize_codes(
            &set(&["TV", "Tv"]),
            &existing,
            &CodeOptions::default(),
            &mut rng(),
        );
        assert_eq!(codes["TV"], "BBB");
        // BTreeMap order puts "TV" before "tv", so the fold resolves to it.
        assert_eq!(codes["Tv"], "BBB");
    }

    #[test]
    fn test_guess_avoids_existing_codes() {
        let mut existing = CodeMap::new();
        existing.insert("Television".to_string(), "TVT".to_string());
        let codes = synthesize_codes(&set(&["tv"]), &existing, &CodeOptions::default(), &mut rng());
        assert_ne!(codes["tv"], "TVT");
    }
}
