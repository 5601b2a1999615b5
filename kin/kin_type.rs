//! Kin categories, their short codes and the selection of kin to report.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The fixed enumeration of kin categories, identified by their short codes.
///
/// "Older" and "younger" collateral kin are split by whether the connecting
/// relative was born before or after Focal's parent (aunts, cousins) or
/// before or after Focal (siblings, nieces and nephews).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KinType {
    /// Children (daughters in one-sex models).
    D,
    /// Grandchildren.
    Gd,
    /// Great-grandchildren.
    Ggd,
    /// Great-great-grandchildren.
    Gggd,
    /// Parents (mother in one-sex models).
    M,
    /// Grandparents.
    Gm,
    /// Great-grandparents.
    Ggm,
    /// Great-great-grandparents.
    Gggm,
    /// Older siblings.
    Os,
    /// Younger siblings.
    Ys,
    /// Nieces and nephews through older siblings.
    Nos,
    /// Nieces and nephews through younger siblings.
    Nys,
    /// Aunts and uncles older than Focal's parent.
    Oa,
    /// Aunts and uncles younger than Focal's parent.
    Ya,
    /// Cousins through older aunts and uncles.
    Coa,
    /// Cousins through younger aunts and uncles.
    Cya,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("'{0}' is not a recognised kin code (expected one of: {list})", list = KinType::code_list())]
pub struct UnknownKinCode(pub String);

impl KinType {
    pub const ALL: [KinType; 16] = [
        KinType::D,
        KinType::Gd,
        KinType::Ggd,
        KinType::Gggd,
        KinType::M,
        KinType::Gm,
        KinType::Ggm,
        KinType::Gggm,
        KinType::Os,
        KinType::Ys,
        KinType::Nos,
        KinType::Nys,
        KinType::Oa,
        KinType::Ya,
        KinType::Coa,
        KinType::Cya,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Self::D => "d",
            Self::Gd => "gd",
            Self::Ggd => "ggd",
            Self::Gggd => "gggd",
            Self::M => "m",
            Self::Gm => "gm",
            Self::Ggm => "ggm",
            Self::Gggm => "gggm",
            Self::Os => "os",
            Self::Ys => "ys",
            Self::Nos => "nos",
            Self::Nys => "nys",
            Self::Oa => "oa",
            Self::Ya => "ya",
            Self::Coa => "coa",
            Self::Cya => "cya",
        }
    }

    /// Human-readable label. Two-sex models count both sexes, so the labels
    /// switch from the female lineage wording to the neutral one.
    pub fn label(self, two_sex: bool) -> &'static str {
        match (self, two_sex) {
            (Self::D, false) => "Daughters",
            (Self::D, true) => "Children",
            (Self::Gd, false) => "Granddaughters",
            (Self::Gd, true) => "Grandchildren",
            (Self::Ggd, false) => "Great-granddaughters",
            (Self::Ggd, true) => "Great-grandchildren",
            (Self::Gggd, false) => "Great-great-granddaughters",
            (Self::Gggd, true) => "Great-great-grandchildren",
            (Self::M, false) => "Mother",
            (Self::M, true) => "Parents",
            (Self::Gm, false) => "Grandmothers",
            (Self::Gm, true) => "Grandparents",
            (Self::Ggm, false) => "Great-grandmothers",
            (Self::Ggm, true) => "Great-grandparents",
            (Self::Gggm, false) => "Great-great-grandmothers",
            (Self::Gggm, true) => "Great-great-grandparents",
            (Self::Os, false) => "Older sisters",
            (Self::Os, true) => "Older siblings",
            (Self::Ys, false) => "Younger sisters",
            (Self::Ys, true) => "Younger siblings",
            (Self::Nos, false) => "Nieces through older sisters",
            (Self::Nos, true) => "Nieces and nephews through older siblings",
            (Self::Nys, false) => "Nieces through younger sisters",
            (Self::Nys, true) => "Nieces and nephews through younger siblings",
            (Self::Oa, false) => "Aunts older than mother",
            (Self::Oa, true) => "Aunts and uncles older than parents",
            (Self::Ya, false) => "Aunts younger than mother",
            (Self::Ya, true) => "Aunts and uncles younger than parents",
            (Self::Coa, false) => "Cousins from older aunts",
            (Self::Coa, true) => "Cousins from older aunts and uncles",
            (Self::Cya, false) => "Cousins from younger aunts",
            (Self::Cya, true) => "Cousins from younger aunts and uncles",
        }
    }

    /// Goodman-Keyfitz-Pullum multiplier turning a female-only count into an
    /// approximate both-sex count.
    pub fn gkp_factor(self) -> f64 {
        match self {
            Self::D | Self::M | Self::Os | Self::Ys => 2.0,
            Self::Gd | Self::Gm | Self::Nos | Self::Nys | Self::Oa | Self::Ya => 4.0,
            Self::Ggd | Self::Ggm | Self::Coa | Self::Cya => 8.0,
            Self::Gggd | Self::Gggm => 16.0,
        }
    }

    fn code_list() -> String {
        Self::ALL
            .iter()
            .map(|kin| kin.code())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for KinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for KinType {
    type Err = UnknownKinCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|kin| kin.code() == needle)
            .ok_or_else(|| UnknownKinCode(s.to_string()))
    }
}

/// Which kin types a run should report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KinSelection {
    #[default]
    All,
    Only(Vec<KinType>),
}

impl KinSelection {
    /// Parses a list of kin codes. An empty list or the single code `all`
    /// selects every kin type.
    pub fn from_codes<S: AsRef<str>>(codes: &[S]) -> Result<Self, UnknownKinCode> {
        if codes.is_empty()
            || (codes.len() == 1 && codes[0].as_ref().trim().eq_ignore_ascii_case("all"))
        {
            return Ok(Self::All);
        }
        let mut kin = codes
            .iter()
            .map(|code| code.as_ref().parse::<KinType>())
            .collect::<Result<Vec<_>, _>>()?;
        kin.sort_unstable();
        kin.dedup();
        Ok(Self::Only(kin))
    }

    pub fn resolve(&self) -> Vec<KinType> {
        match self {
            Self::All => KinType::ALL.to_vec(),
            Self::Only(kin) => kin.clone(),
        }
    }
}
