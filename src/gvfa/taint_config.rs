// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! The taint specification file.
//!
//! One directive per line, `#` starts a comment:
//!
//! ```text
//! SOURCE <fn> [<loc> <access> <type>]...
//! SINK   <fn> [<loc> <access> <type>]...
//! IGNORE <fn>
//! PIPE   <fn> <loc_from> <acc_from> <loc_to> <acc_to>
//! ```
//!
//! with `<loc>` one of `Arg<N>`, `AfterArg<N>`, `Ret`; `<access>` one of
//! `V` (value), `D` (dereference), `R` (reference); `<type>` `T` (tainted)
//! or `U` (untainted).

use std::collections::{HashMap, HashSet};
use std::path::Path;

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::digit1;
use nom::combinator::{all_consuming, map, map_res};
use nom::sequence::preceded;
use nom::IResult;

use crate::error::{AnalysisError, AnalysisResult};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Loc {
    Arg(u32),
    /// The argument at this index and every later one (varargs).
    AfterArg(u32),
    Ret,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Value,
    Deref,
    Reference,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaintKind {
    Tainted,
    Untainted,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TaintEntry {
    pub loc: Loc,
    pub access: Access,
    pub kind: TaintKind,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PipeSpec {
    pub from: (Loc, Access),
    pub to: (Loc, Access),
}

#[derive(Clone, Debug, Default)]
pub struct TaintConfig {
    pub sources: HashMap<String, Vec<TaintEntry>>,
    pub sinks: HashMap<String, Vec<TaintEntry>>,
    pub ignores: HashSet<String>,
    pub pipes: HashMap<String, Vec<PipeSpec>>,
}

fn parse_loc(input: &str) -> IResult<&str, Loc> {
    alt((
        map(
            preceded(tag("AfterArg"), map_res(digit1, str::parse::<u32>)),
            Loc::AfterArg,
        ),
        map(
            preceded(tag("Arg"), map_res(digit1, str::parse::<u32>)),
            Loc::Arg,
        ),
        map(tag("Ret"), |_| Loc::Ret),
    ))(input)
}

fn loc_token(token: &str, lineno: usize) -> AnalysisResult<Loc> {
    match all_consuming(parse_loc)(token) {
        Ok((_, loc)) => Ok(loc),
        Err(_) => Err(AnalysisError::InputInvalid(format!(
            "line {}: bad location `{}`",
            lineno, token
        ))),
    }
}

fn access_token(token: &str, lineno: usize) -> AnalysisResult<Access> {
    match token {
        "V" => Ok(Access::Value),
        "D" => Ok(Access::Deref),
        "R" => Ok(Access::Reference),
        _ => Err(AnalysisError::InputInvalid(format!(
            "line {}: bad access `{}`",
            lineno, token
        ))),
    }
}

fn kind_token(token: &str, lineno: usize) -> AnalysisResult<TaintKind> {
    match token {
        "T" => Ok(TaintKind::Tainted),
        "U" => Ok(TaintKind::Untainted),
        _ => Err(AnalysisError::InputInvalid(format!(
            "line {}: bad taint type `{}`",
            lineno, token
        ))),
    }
}

impl TaintConfig {
    pub fn from_file(path: &Path) -> AnalysisResult<TaintConfig> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AnalysisError::InputInvalid(format!("{}: {}", path.display(), e)))?;
        Self::from_str_contents(&text)
    }

    pub fn from_str_contents(text: &str) -> AnalysisResult<TaintConfig> {
        let mut config = TaintConfig::default();
        for (i, raw_line) in text.lines().enumerate() {
            let lineno = i + 1;
            let line = match raw_line.find('#') {
                Some(pos) => &raw_line[..pos],
                None => raw_line,
            };
            let mut tokens = line.split_whitespace();
            let Some(directive) = tokens.next() else {
                continue;
            };
            match directive {
                "SOURCE" | "SINK" => {
                    let func = tokens
                        .next()
                        .ok_or_else(|| {
                            AnalysisError::InputInvalid(format!(
                                "line {}: missing function name",
                                lineno
                            ))
                        })?
                        .to_string();
                    let mut entries = Vec::new();
                    let rest: Vec<&str> = tokens.collect();
                    if rest.len() % 3 != 0 {
                        return Err(AnalysisError::InputInvalid(format!(
                            "line {}: entries come in (loc, access, type) triples",
                            lineno
                        )));
                    }
                    for triple in rest.chunks(3) {
                        entries.push(TaintEntry {
                            loc: loc_token(triple[0], lineno)?,
                            access: access_token(triple[1], lineno)?,
                            kind: kind_token(triple[2], lineno)?,
                        });
                    }
                    if directive == "SOURCE" {
                        config.sources.entry(func).or_default().extend(entries);
                    } else {
                        config.sinks.entry(func).or_default().extend(entries);
                    }
                }
                "IGNORE" => {
                    let func = tokens.next().ok_or_else(|| {
                        AnalysisError::InputInvalid(format!(
                            "line {}: missing function name",
                            lineno
                        ))
                    })?;
                    config.ignores.insert(func.to_string());
                }
                "PIPE" => {
                    let parts: Vec<&str> = tokens.collect();
                    if parts.len() != 5 {
                        return Err(AnalysisError::InputInvalid(format!(
                            "line {}: PIPE takes <fn> <loc> <acc> <loc> <acc>",
                            lineno
                        )));
                    }
                    let spec = PipeSpec {
                        from: (loc_token(parts[1], lineno)?, access_token(parts[2], lineno)?),
                        to: (loc_token(parts[3], lineno)?, access_token(parts[4], lineno)?),
                    };
                    config
                        .pipes
                        .entry(parts[0].to_string())
                        .or_default()
                        .push(spec);
                }
                _ => {
                    return Err(AnalysisError::InputInvalid(format!(
                        "line {}: unknown directive `{}`",
                        lineno, directive
                    )));
                }
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_directives() {
        let text = "\
# system taint model
SOURCE getenv Ret V T
SOURCE read Arg1 D T AfterArg2 V U
SINK strcpy Arg1 V T
IGNORE sanitize
PIPE memcpy Arg1 D Arg0 D
";
        let config = TaintConfig::from_str_contents(text).unwrap();
        assert_eq!(
            config.sources["getenv"],
            vec![TaintEntry {
                loc: Loc::Ret,
                access: Access::Value,
                kind: TaintKind::Tainted
            }]
        );
        assert_eq!(config.sources["read"].len(), 2);
        assert_eq!(config.sources["read"][1].loc, Loc::AfterArg(2));
        assert_eq!(config.sinks["strcpy"][0].loc, Loc::Arg(1));
        assert!(config.ignores.contains("sanitize"));
        let pipe = config.pipes["memcpy"][0];
        assert_eq!(pipe.from.0, Loc::Arg(1));
        assert_eq!(pipe.to.0, Loc::Arg(0));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(TaintConfig::from_str_contents("SOURCE").is_err());
        assert!(TaintConfig::from_str_contents("SOURCE f Arg1 V").is_err());
        assert!(TaintConfig::from_str_contents("SOURCE f ArgX V T").is_err());
        assert!(TaintConfig::from_str_contents("FROB f").is_err());
        assert!(TaintConfig::from_str_contents("PIPE f Arg0 D").is_err());
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let config =
            TaintConfig::from_str_contents("\n# only comments\n   \nSOURCE f Ret V T # tail\n")
                .unwrap();
        assert_eq!(config.sources.len(), 1);
    }
}
