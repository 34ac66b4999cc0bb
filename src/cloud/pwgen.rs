use rand::seq::SliceRandom;
use rand::Rng;

const LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b")(*&^%#@!~";

pub const TOKEN_LENGTH: usize = 64;
const MIN_DIGITS: usize = 10;
const MIN_SYMBOLS: usize = 5;

/// Generates the tunnel auth token: 64 mixed characters with a minimum
/// number of digits and symbols, shuffled so the mandatory characters are
/// not clustered at either end.
pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();

    let mut chars: Vec<u8> = Vec::with_capacity(TOKEN_LENGTH);
    for _ in 0..MIN_DIGITS {
        chars.push(DIGITS[rng.gen_range(0..DIGITS.len())]);
    }
    for _ in 0..MIN_SYMBOLS {
        chars.push(SYMBOLS[rng.gen_range(0..SYMBOLS.len())]);
    }
    while chars.len() < TOKEN_LENGTH {
        chars.push(LETTERS[rng.gen_range(0..LETTERS.len())]);
    }
    chars.shuffle(&mut rng);

    chars.into_iter().map(|c| c as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_has_expected_shape() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_LENGTH);

        let digits = token.chars().filter(|c| c.is_ascii_digit()).count();
        let symbols = token
            .chars()
            .filter(|c| SYMBOLS.contains(&(*c as u8)))
            .count();
        assert!(digits >= MIN_DIGITS);
        assert!(symbols >= MIN_SYMBOLS);
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(generate_token(), generate_token());
    }
}
