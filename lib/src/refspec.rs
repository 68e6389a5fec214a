// Copyright 2023 The Wrangle Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Refspecs map remote ref names to local ones during fetch and push.
//!
//! Grammar: `[+^][<src>][:<dst>]` or `tag <name>`. A leading `+` forces
//! non-fast-forward updates; `^` negates the spec (matching refs are
//! excluded and map to no destination). `*` is a glob matching a trailing
//! segment and may appear only once, at the end; src and dst must then both
//! be globs.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefspecError {
    #[error("empty refspec")]
    Empty,
    #[error("invalid glob pattern {0:?}: there can only be one '*' at the end")]
    InvalidGlob(String),
    #[error("must not specify dst in negated refspec")]
    NegatedDst,
    #[error("both src and dst must be glob patterns if one is a glob pattern")]
    MixedGlob,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Refspec {
    pub force: bool,
    pub negate: bool,
    src: String,
    dst: String,
    tag: Option<String>,
    src_star: Option<usize>,
    dst_star: Option<usize>,
}

fn glob_index(s: &str) -> Result<Option<usize>, RefspecError> {
    match s.find('*') {
        None => Ok(None),
        Some(i) if i == s.len() - 1 => Ok(Some(i)),
        Some(_) => Err(RefspecError::InvalidGlob(s.to_owned())),
    }
}

impl Refspec {
    pub fn new(src: &str, dst: &str, negate: bool, force: bool) -> Result<Self, RefspecError> {
        let spec = Self {
            force,
            negate,
            src: src.to_owned(),
            dst: dst.to_owned(),
            tag: None,
            src_star: glob_index(src)?,
            dst_star: glob_index(dst)?,
        };
        spec.check()?;
        Ok(spec)
    }

    pub fn tag(name: &str) -> Self {
        Self {
            force: false,
            negate: false,
            src: String::new(),
            dst: String::new(),
            tag: Some(name.to_owned()),
            src_star: None,
            dst_star: None,
        }
    }

    /// The default fetch refspec for a remote:
    /// `+refs/heads/*:refs/remotes/<remote>/*`.
    pub fn default_fetch(remote: &str) -> Self {
        Self::new(
            "refs/heads/*",
            &format!("refs/remotes/{remote}/*"),
            false,
            true,
        )
        .unwrap()
    }

    fn check(&self) -> Result<(), RefspecError> {
        if self.negate {
            if !self.dst.is_empty() {
                return Err(RefspecError::NegatedDst);
            }
        } else if self.src_star.is_some() != self.dst_star.is_some() && !self.dst.is_empty() {
            return Err(RefspecError::MixedGlob);
        } else if self.src_star.is_some() && self.dst.is_empty() {
            return Err(RefspecError::MixedGlob);
        }
        Ok(())
    }

    pub fn is_glob(&self) -> bool {
        self.src_star.is_some()
    }

    pub fn src(&self) -> String {
        match &self.tag {
            Some(name) => format!("refs/tags/{name}"),
            None => self.src.clone(),
        }
    }

    pub fn dst(&self) -> String {
        match &self.tag {
            Some(name) => format!("refs/tags/{name}"),
            None => self.dst.clone(),
        }
    }

    pub fn src_match_ref(&self, r: &str) -> bool {
        let src = self.src();
        match self.src_star {
            None => src == r,
            Some(i) => i < r.len() && r[..i] == src[..i],
        }
    }

    /// Whether this (negated) spec excludes `r`.
    pub fn exclude(&self, r: &str) -> bool {
        self.negate && self.src_match_ref(r)
    }

    pub fn dst_match_ref(&self, r: &str) -> bool {
        let dst = self.dst();
        if dst.is_empty() || r.is_empty() {
            return false;
        }
        match self.dst_star {
            None => dst == r,
            Some(i) => i < r.len() && r[..i] == dst[..i],
        }
    }

    /// The destination ref that source ref `p` maps to, if any. Negated
    /// specs match but produce no destination.
    pub fn dst_for_ref(&self, p: &str) -> Option<String> {
        let dst = self.dst();
        if dst.is_empty() || p.is_empty() {
            return None;
        }
        let src = self.src();
        match self.src_star {
            None => (src == p).then_some(dst),
            Some(i) => {
                if i >= p.len() || p[..i] != src[..i] {
                    return None;
                }
                let dst_star = self.dst_star.expect("glob dst checked at construction");
                Some(format!("{}{}", &dst[..dst_star], &p[i..]))
            }
        }
    }
}

impl fmt::Display for Refspec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.force {
            write!(f, "+")?;
        }
        if self.negate {
            write!(f, "^")?;
        }
        match &self.tag {
            Some(name) => write!(f, "tag {name}"),
            None => {
                write!(f, "{}", self.src)?;
                if !self.dst.is_empty() {
                    write!(f, ":{}", self.dst)?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for Refspec {
    type Err = RefspecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rest = s;
        let mut force = false;
        let mut negate = false;
        if let Some(stripped) = rest.strip_prefix('+') {
            force = true;
            rest = stripped;
        }
        if let Some(stripped) = rest.strip_prefix('^') {
            negate = true;
            rest = stripped;
        }
        if rest.is_empty() {
            return Err(RefspecError::Empty);
        }
        if let Some(name) = rest.strip_prefix("tag ") {
            let mut spec = Self::tag(name);
            spec.force = force;
            spec.negate = negate;
            return Ok(spec);
        }
        let (src, dst) = match rest.split_once(':') {
            Some((src, dst)) => (src, dst),
            None => (rest, ""),
        };
        Self::new(src, dst, negate, force)
    }
}

impl serde::Serialize for Refspec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Refspec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
