use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stem identifiers, in the order the 6-source model produces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stem {
    Drums,
    Bass,
    Other,
    Vocals,
    Guitar,
    Piano,
}

impl Stem {
    pub const ALL: [Stem; 6] = [
        Stem::Drums,
        Stem::Bass,
        Stem::Other,
        Stem::Vocals,
        Stem::Guitar,
        Stem::Piano,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stem::Drums => "drums",
            Stem::Bass => "bass",
            Stem::Other => "other",
            Stem::Vocals => "vocals",
            Stem::Guitar => "guitar",
            Stem::Piano => "piano",
        }
    }

    pub fn parse(name: &str) -> Option<Stem> {
        Stem::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(name.trim()))
    }

    /// Position in the fixed production order.
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Stem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stem::parse(s).ok_or_else(|| {
            format!("Unknown stem '{s}'. Choices: drums, bass, other, vocals, guitar, piano")
        })
    }
}

/// Sort and dedupe a configured stem list into production order.
pub fn in_production_order(stems: &[Stem]) -> Vec<Stem> {
    let mut out: Vec<Stem> = stems.to_vec();
    out.sort_by_key(Stem::index);
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(Stem::parse("Vocals"), Some(Stem::Vocals));
        assert_eq!(Stem::parse(" piano "), Some(Stem::Piano));
        assert_eq!(Stem::parse("kazoo"), None);
        assert!("kazoo".parse::<Stem>().is_err());
    }

    #[test]
    fn production_order_is_fixed() {
        let picked = in_production_order(&[Stem::Piano, Stem::Drums, Stem::Vocals, Stem::Drums]);
        assert_eq!(picked, vec![Stem::Drums, Stem::Vocals, Stem::Piano]);
        let names: Vec<_> = Stem::ALL.iter().map(Stem::as_str).collect();
        assert_eq!(names, ["drums", "bass", "other", "vocals", "guitar", "piano"]);
    }
}
