//! # Speakable identifiers
//!
//! Ports are turned into short word sequences so a share can be named over
//! the phone. The encoding is positional base-256: `words[0]` is the least
//! significant digit. The word list is versioned; changing it breaks every
//! name already handed out.
//!
//! A [`SessionName`] joins three numbers with this encoding:
//!
//! ```text
//! tunnel port    control API port   relay host number (optional)
//! ┌──────────┐   ┌──────────┐       ┌──────────┐
//! maple_acorn  :  tiger_able    @   comet
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Bumped whenever [`WORDS`] changes.
pub const WORDLIST_VERSION: u32 = 1;

/// Separator between the words of a single number.
const WORD_SEPARATOR: char = '_';

const WORDS: [&str; 256] = [
    "able", "acid", "acorn", "actor", "adobe", "agent", "alarm", "album", "alpha", "amber",
    "anchor", "angle", "apple", "apron", "arena", "arrow", "atlas", "attic", "audio", "autumn",
    "avenue", "badge", "bagel", "baker", "bamboo", "banjo", "barn", "basil", "basket", "beacon",
    "beaver", "berry", "bison", "blade", "blanket", "blossom", "boat", "bonus", "border",
    "bottle", "breeze", "brick", "bridge", "bronze", "brook", "bucket", "buffalo", "bugle",
    "cabin", "cactus", "camel", "candle", "canoe", "canyon", "carbon", "cargo", "carpet",
    "castle", "cedar", "cello", "chalk", "cherry", "chess", "cider", "circle", "citrus", "clover",
    "cobalt", "coffee", "comet", "copper", "coral", "cotton", "cougar", "crane", "crayon",
    "cricket", "crystal", "cupid", "dagger", "daisy", "delta", "denim", "desert", "diesel",
    "dingo", "dolphin", "domino", "donkey", "dragon", "dune", "eagle", "earth", "echo", "eclipse",
    "elbow", "ember", "emerald", "engine", "falcon", "feather", "fern", "ferry", "fiddle", "fig",
    "flame", "flute", "forest", "fossil", "fox", "galaxy", "garden", "garlic", "gecko", "ginger",
    "glacier", "globe", "gopher", "granite", "grape", "gravel", "guitar", "hammer", "harbor",
    "hazel", "helmet", "heron", "hickory", "honey", "hornet", "husky", "igloo", "indigo",
    "island", "ivory", "jacket", "jaguar", "jasmine", "jelly", "jigsaw", "jungle", "kayak",
    "kettle", "kiwi", "koala", "ladder", "lagoon", "lantern", "laser", "lemon", "lilac", "linen",
    "lizard", "llama", "lobster", "locket", "lotus", "lunar", "magnet", "mango", "maple",
    "marble", "meadow", "melon", "meteor", "mint", "mirror", "mitten", "monsoon", "mosaic",
    "moss", "nectar", "needle", "nickel", "noodle", "nutmeg", "oasis", "ocean", "olive", "onion",
    "opal", "orbit", "orchid", "otter", "oyster", "paddle", "panda", "panther", "paper", "parrot",
    "peach", "pebble", "pepper", "piano", "pickle", "pilot", "pine", "planet", "plum", "polar",
    "poppy", "prairie", "puzzle", "quartz", "quill", "rabbit", "radar", "radish", "raven", "reef",
    "ribbon", "river", "robin", "rocket", "saddle", "saffron", "salmon", "sandal", "satin",
    "scarf", "shadow", "silver", "sketch", "sparrow", "spruce", "squash", "summit", "sunset",
    "tango", "thistle", "thunder", "tiger", "timber", "topaz", "tulip", "tundra", "turtle",
    "umbrella", "velvet", "violet", "wagon", "walnut", "whale", "whistle", "willow", "window",
    "winter", "wizard", "yarrow", "yodel", "yogurt", "yucca", "zebra", "zephyr", "zinnia",
    "zircon",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown word `{0}`")]
    UnknownWord(String),

    #[error("no words to decode")]
    Empty,

    #[error("value does not fit in the target integer")]
    Overflow,

    #[error("malformed name: {0}")]
    Malformed(String),

    #[error("`{0}` cannot lead a multi-word number")]
    NonCanonical(String),
}

/// Encodes `n` as words, least significant digit first.
pub fn encode(mut n: u64) -> Vec<&'static str> {
    let base = WORDS.len() as u64;
    let mut words = Vec::new();
    loop {
        words.push(WORDS[(n % base) as usize]);
        n /= base;
        if n == 0 {
            return words;
        }
    }
}

/// Decodes words produced by [`encode`] back into the number.
pub fn decode<S: AsRef<str>>(words: &[S]) -> Result<u64, DecodeError> {
    if words.is_empty() {
        return Err(DecodeError::Empty);
    }

    let base = WORDS.len() as u64;
    let mut value: u64 = 0;
    for (i, word) in words.iter().rev().enumerate() {
        let word = word.as_ref();
        let digit = WORDS
            .iter()
            .position(|candidate| *candidate == word)
            .ok_or_else(|| DecodeError::UnknownWord(word.to_string()))?;
        // A zero most significant digit would give a second spelling of the
        // same number.
        if i == 0 && digit == 0 && words.len() > 1 {
            return Err(DecodeError::NonCanonical(word.to_string()));
        }
        value = value
            .checked_mul(base)
            .and_then(|v| v.checked_add(digit as u64))
            .ok_or(DecodeError::Overflow)?;
    }
    Ok(value)
}

/// Encodes `n` and joins the words with `_`.
pub fn wordify(n: u64) -> String {
    encode(n).join(&WORD_SEPARATOR.to_string())
}

/// Inverse of [`wordify`].
pub fn dewordify(joined: &str) -> Result<u64, DecodeError> {
    let words: Vec<&str> = joined.split(WORD_SEPARATOR).collect();
    decode(&words)
}

fn dewordify_port(joined: &str) -> Result<u16, DecodeError> {
    u16::try_from(dewordify(joined)?).map_err(|_| DecodeError::Overflow)
}

/// The name a share is published under.
///
/// It carries everything the connecting side needs to reach the share: the
/// relay's public tcp port, the port of the control API behind the tunnel,
/// and the number of the relay host when it is not the default endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionName {
    pub tunnel_port: u16,
    pub control_api_port: u16,
    pub relay_host: Option<u64>,
}

impl SessionName {
    pub fn new(tunnel_port: u16, control_api_port: u16, relay_host: Option<u64>) -> Self {
        Self {
            tunnel_port,
            control_api_port,
            relay_host,
        }
    }

    /// Relay host number, `0` for the default endpoint.
    pub fn relay_host_number(&self) -> u64 {
        self.relay_host.unwrap_or(0)
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            wordify(u64::from(self.tunnel_port)),
            wordify(u64::from(self.control_api_port))
        )?;
        if let Some(host) = self.relay_host {
            write!(f, "@{}", wordify(host))?;
        }
        Ok(())
    }
}

impl FromStr for SessionName {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ports, host) = match s.split_once('@') {
            Some((ports, host)) => (ports, Some(host)),
            None => (s, None),
        };

        let (tunnel, api) = ports
            .split_once(':')
            .ok_or_else(|| DecodeError::Malformed(format!("expected `word_word:word_word`, got `{s}`")))?;

        let relay_host = match host {
            Some(host) if !host.is_empty() => Some(dewordify(host)?),
            _ => None,
        };

        Ok(Self {
            tunnel_port: dewordify_port(tunnel)?,
            control_api_port: dewordify_port(api)?,
            relay_host,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn word_list_has_no_duplicates_or_separators() {
        let unique: HashSet<_> = WORDS.iter().collect();
        assert_eq!(unique.len(), WORDS.len());
        assert!(WORDS.len().is_power_of_two());
        for word in WORDS {
            assert!(!word.contains(['_', ':', '@']), "{word}");
        }
    }

    #[test]
    fn zero_round_trips() {
        assert_eq!(encode(0), vec![WORDS[0]]);
        assert_eq!(decode(&encode(0)).unwrap(), 0);
    }

    #[test]
    fn every_port_round_trips() {
        for n in 0..=u64::from(u16::MAX) {
            let words = encode(n);
            assert!(words.len() <= 2);
            assert_eq!(decode(&words).unwrap(), n);
        }
    }

    #[test]
    fn encoding_is_positional_little_endian() {
        assert_eq!(encode(257), vec![WORDS[1], WORDS[1]]);
        assert_eq!(encode(3 * 256 + 7), vec![WORDS[7], WORDS[3]]);
    }

    #[test]
    fn unknown_word_is_rejected() {
        assert_eq!(
            decode(&["able", "notaword"]),
            Err(DecodeError::UnknownWord("notaword".to_string()))
        );
        assert_eq!(decode::<&str>(&[]), Err(DecodeError::Empty));
    }

    #[test]
    fn leading_zero_digit_is_rejected() {
        let padded = [WORDS[1], WORDS[0]];
        assert_eq!(
            decode(&padded),
            Err(DecodeError::NonCanonical(WORDS[0].to_string()))
        );
        assert_eq!(decode(&[WORDS[0]]).unwrap(), 0);
        assert_eq!(decode(&[WORDS[0], WORDS[1]]).unwrap(), 256);

        let padded_name = format!("{}_{}:{}", WORDS[1], WORDS[0], WORDS[1]);
        assert!(matches!(
            padded_name.parse::<SessionName>(),
            Err(DecodeError::NonCanonical(_))
        ));
    }

    #[test]
    fn large_values_overflow_instead_of_wrapping() {
        let words = vec![WORDS[255]; 9];
        assert_eq!(decode(&words), Err(DecodeError::Overflow));
        assert_eq!(decode(&encode(u64::MAX)).unwrap(), u64::MAX);
    }

    #[test]
    fn session_name_round_trips() {
        let name = SessionName::new(12345, 50123, Some(2));
        let text = name.to_string();
        assert_eq!(text.matches('@').count(), 1);
        assert_eq!(text.parse::<SessionName>().unwrap(), name);
        assert_eq!(text.parse::<SessionName>().unwrap().to_string(), text);

        let flat = SessionName::new(80, 0, None);
        assert!(!flat.to_string().contains('@'));
        assert_eq!(flat.to_string().parse::<SessionName>().unwrap(), flat);
    }

    #[test]
    fn session_name_rejects_garbage() {
        assert!(matches!(
            "justoneword".parse::<SessionName>(),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            "able:zzz".parse::<SessionName>(),
            Err(DecodeError::UnknownWord(_))
        ));
        let too_big = format!("{}:able", wordify(70_000));
        assert_eq!(too_big.parse::<SessionName>(), Err(DecodeError::Overflow));
    }

    #[test]
    fn empty_host_suffix_means_default_relay() {
        let name: SessionName = format!("{}:{}@", wordify(1), wordify(2)).parse().unwrap();
        assert_eq!(name.relay_host, None);
        assert_eq!(name.relay_host_number(), 0);
    }
}
