//! Value generators backing ClusterGenerator references: random passwords
//! with shape constraints and v4 UUIDs.

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::crd::PasswordSpec;

const LOWER: &str = "abcdefghijklmnopqrstuvwxyz";
const UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &str = "0123456789";
const DEFAULT_SYMBOLS: &str = "~!@#$%^&*()_+`-={}|[]\\:\"<>?,./";

/// Generate a password with at least `digits` digits and `symbols` symbol
/// characters, the rest letters, shuffled.
pub fn generate_password(spec: &PasswordSpec) -> Result<String> {
    if spec.digits + spec.symbols > spec.length {
        return Err(anyhow::anyhow!(
            "password spec requests {} digits and {} symbols but only {} characters",
            spec.digits,
            spec.symbols,
            spec.length
        ));
    }

    let symbol_alphabet = spec
        .symbol_characters
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SYMBOLS.to_string());

    let letter_alphabet = if spec.no_upper {
        LOWER.to_string()
    } else {
        format!("{LOWER}{UPPER}")
    };

    let mut rng = rand::thread_rng();
    let mut characters = Vec::with_capacity(spec.length);

    pick(&mut rng, DIGITS, spec.digits, spec.allow_repeat, &mut characters)?;
    pick(
        &mut rng,
        &symbol_alphabet,
        spec.symbols,
        spec.allow_repeat,
        &mut characters,
    )?;
    pick(
        &mut rng,
        &letter_alphabet,
        spec.length - spec.digits - spec.symbols,
        spec.allow_repeat,
        &mut characters,
    )?;

    characters.shuffle(&mut rng);
    Ok(characters.into_iter().collect())
}

fn pick(
    rng: &mut impl Rng,
    alphabet: &str,
    count: usize,
    allow_repeat: bool,
    out: &mut Vec<char>,
) -> Result<()> {
    let mut pool: Vec<char> = alphabet.chars().collect();
    if pool.is_empty() && count > 0 {
        return Err(anyhow::anyhow!("empty alphabet for password generation"));
    }

    for _ in 0..count {
        if allow_repeat {
            out.push(pool[rng.gen_range(0..pool.len())]);
        } else {
            if pool.is_empty() {
                return Err(anyhow::anyhow!(
                    "alphabet exhausted; enable allowRepeat or shorten the password"
                ));
            }
            let index = rng.gen_range(0..pool.len());
            out.push(pool.swap_remove(index));
        }
    }

    Ok(())
}

pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_honors_length_and_classes() {
        let spec = PasswordSpec {
            length: 32,
            digits: 5,
            symbols: 4,
            symbol_characters: Some("!@#".into()),
            no_upper: false,
            allow_repeat: true,
        };

        let password = generate_password(&spec).unwrap();
        assert_eq!(password.chars().count(), 32);
        assert!(password.chars().filter(|c| c.is_ascii_digit()).count() >= 5);
        assert!(password.chars().filter(|c| "!@#".contains(*c)).count() >= 4);
    }

    #[test]
    fn no_upper_excludes_uppercase() {
        let spec = PasswordSpec {
            length: 24,
            no_upper: true,
            allow_repeat: true,
            ..Default::default()
        };

        let password = generate_password(&spec).unwrap();
        assert!(!password.chars().any(|c| c.is_ascii_uppercase()));
    }

    #[test]
    fn over_constrained_spec_fails() {
        let spec = PasswordSpec {
            length: 4,
            digits: 3,
            symbols: 2,
            ..Default::default()
        };
        assert!(generate_password(&spec).is_err());
    }

    #[test]
    fn no_repeat_exhaustion_fails() {
        let spec = PasswordSpec {
            length: 5,
            digits: 0,
            symbols: 5,
            symbol_characters: Some("!@#".into()),
            allow_repeat: false,
            ..Default::default()
        };
        assert!(generate_password(&spec).is_err());
    }

    #[test]
    fn uuid_shape() {
        let value = generate_uuid();
        assert_eq!(value.len(), 36);
        assert_eq!(value.chars().filter(|c| *c == '-').count(), 4);
    }
}
