//! Control command grammar.
//!
//! ```text
//! command    = verb SP param-list
//! param-list = param *("," param)
//! param      = key "=" value / "onetime"
//! verb       = "enable" / "enable_random" / "disable"
//! key        = "name" / "probability" / "failnum" / "failinfo"
//! ```
//!
//! Parsing is split into a tokenizer ([`tokenize`]) that only knows the
//! shape of a line, and [`Command::parse`] that validates keys per verb and
//! converts values. Either step rejects the whole line; nothing is applied
//! from a line that does not parse.

use std::fmt;
use std::str::FromStr;

use crate::point::{FailInfo, FailurePoint, Mode, DEFAULT_FAIL_CODE};
use crate::registry::Registry;

/// Longest accepted command line in bytes, excluding the newline.
pub const MAX_LINE_LEN: usize = 4096;

const KEY_NAME: &str = "name";
const KEY_PROBABILITY: &str = "probability";
const KEY_FAILNUM: &str = "failnum";
const KEY_FAILINFO: &str = "failinfo";
const FLAG_ONETIME: &str = "onetime";
const FAILINFO_NONE: &str = "none";

/// Errors produced while parsing a command line.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,

    #[error("command exceeds {} bytes", MAX_LINE_LEN)]
    TooLong,

    #[error("command is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown verb: {0}")]
    UnknownVerb(String),

    #[error("missing parameters for '{0}'")]
    MissingParams(String),

    #[error("malformed parameter '{0}', expected key=value")]
    MalformedParam(String),

    #[error("parameter '{key}' not accepted by '{verb}'")]
    UnexpectedKey { verb: String, key: String },

    #[error("duplicate parameter '{0}'")]
    DuplicateKey(String),

    #[error("missing required parameter '{0}'")]
    MissingKey(&'static str),

    #[error("failure point name must not be empty")]
    EmptyName,

    #[error("invalid value for '{key}': {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("failnum must not be zero")]
    ZeroFailnum,
}

/// Command verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Enable,
    EnableRandom,
    Disable,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Enable => "enable",
            Verb::EnableRandom => "enable_random",
            Verb::Disable => "disable",
        }
    }

    fn accepts(&self, key: &str) -> bool {
        match self {
            Verb::Enable => matches!(key, KEY_NAME | KEY_FAILNUM | KEY_FAILINFO | FLAG_ONETIME),
            Verb::EnableRandom => matches!(
                key,
                KEY_NAME | KEY_PROBABILITY | KEY_FAILNUM | KEY_FAILINFO | FLAG_ONETIME
            ),
            Verb::Disable => key == KEY_NAME,
        }
    }
}

impl FromStr for Verb {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enable" => Ok(Verb::Enable),
            "enable_random" => Ok(Verb::EnableRandom),
            "disable" => Ok(Verb::Disable),
            other => Err(ParseError::UnknownVerb(other.to_string())),
        }
    }
}

/// One `key=value` (or bare flag) token of a parameter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param<'a> {
    pub key: &'a str,
    pub value: Option<&'a str>,
}

/// Split a line into its verb and raw parameters.
///
/// Only the shape is checked here: one space after the verb, comma separated
/// parameters, `=` inside each parameter except the `onetime` flag.
pub fn tokenize(line: &str) -> Result<(&str, Vec<Param<'_>>), ParseError> {
    if line.is_empty() {
        return Err(ParseError::Empty);
    }
    if line.len() > MAX_LINE_LEN {
        return Err(ParseError::TooLong);
    }

    let (verb, rest) = match line.split_once(' ') {
        Some((verb, rest)) => (verb, rest),
        None => (line, ""),
    };
    if rest.is_empty() {
        // Surface an unknown verb before complaining about parameters
        verb.parse::<Verb>()?;
        return Err(ParseError::MissingParams(verb.to_string()));
    }

    let params = rest
        .split(',')
        .map(|raw| match raw.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok(Param {
                key,
                value: Some(value),
            }),
            None if raw == FLAG_ONETIME => Ok(Param {
                key: raw,
                value: None,
            }),
            _ => Err(ParseError::MalformedParam(raw.to_string())),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((verb, params))
}

/// A parsed control request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Enable {
        name: String,
        failnum: i64,
        failinfo: FailInfo,
        onetime: bool,
    },
    EnableRandom {
        name: String,
        probability: f64,
        failnum: i64,
        failinfo: FailInfo,
        onetime: bool,
    },
    Disable {
        name: String,
    },
}

#[derive(Default)]
struct Fields<'a> {
    name: Option<&'a str>,
    probability: Option<&'a str>,
    failnum: Option<&'a str>,
    failinfo: Option<&'a str>,
    onetime: bool,
}

impl<'a> Fields<'a> {
    fn collect(verb: Verb, params: &[Param<'a>]) -> Result<Self, ParseError> {
        let mut fields = Fields::default();
        for param in params {
            if !verb.accepts(param.key) {
                return Err(ParseError::UnexpectedKey {
                    verb: verb.as_str().to_string(),
                    key: param.key.to_string(),
                });
            }
            let slot = match param.key {
                KEY_NAME => &mut fields.name,
                KEY_PROBABILITY => &mut fields.probability,
                KEY_FAILNUM => &mut fields.failnum,
                KEY_FAILINFO => &mut fields.failinfo,
                _ => {
                    if fields.onetime {
                        return Err(ParseError::DuplicateKey(param.key.to_string()));
                    }
                    fields.onetime = true;
                    continue;
                }
            };
            if slot.is_some() {
                return Err(ParseError::DuplicateKey(param.key.to_string()));
            }
            // Keys other than the flag always carry a value after tokenizing
            *slot = param.value;
        }
        Ok(fields)
    }

    fn name(&self) -> Result<String, ParseError> {
        match self.name {
            None => Err(ParseError::MissingKey(KEY_NAME)),
            Some("") => Err(ParseError::EmptyName),
            Some(name) => Ok(name.to_string()),
        }
    }

    fn failnum(&self) -> Result<i64, ParseError> {
        match self.failnum {
            None => Ok(DEFAULT_FAIL_CODE),
            Some(raw) => match raw.parse::<i64>() {
                Ok(0) => Err(ParseError::ZeroFailnum),
                Ok(n) => Ok(n),
                Err(_) => Err(invalid(KEY_FAILNUM, raw)),
            },
        }
    }

    fn failinfo(&self) -> Result<FailInfo, ParseError> {
        match self.failinfo {
            None | Some(FAILINFO_NONE) => Ok(FailInfo::NONE),
            Some(raw) => raw
                .parse::<u64>()
                .map(FailInfo::new)
                .map_err(|_| invalid(KEY_FAILINFO, raw)),
        }
    }

    fn probability(&self) -> Result<f64, ParseError> {
        let raw = self
            .probability
            .ok_or(ParseError::MissingKey(KEY_PROBABILITY))?;
        match raw.parse::<f64>() {
            Ok(p) if p.is_nan() => Err(invalid(KEY_PROBABILITY, raw)),
            Ok(p) => Ok(p.clamp(0.0, 1.0)),
            Err(_) => Err(invalid(KEY_PROBABILITY, raw)),
        }
    }
}

fn invalid(key: &'static str, value: &str) -> ParseError {
    ParseError::InvalidValue {
        key,
        value: value.to_string(),
    }
}

impl Command {
    /// Parse one command line. A single trailing newline is ignored.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        let (verb, params) = tokenize(line)?;
        let verb: Verb = verb.parse()?;
        let fields = Fields::collect(verb, &params)?;

        let command = match verb {
            Verb::Enable => Command::Enable {
                name: fields.name()?,
                failnum: fields.failnum()?,
                failinfo: fields.failinfo()?,
                onetime: fields.onetime,
            },
            Verb::EnableRandom => Command::EnableRandom {
                name: fields.name()?,
                probability: fields.probability()?,
                failnum: fields.failnum()?,
                failinfo: fields.failinfo()?,
                onetime: fields.onetime,
            },
            Verb::Disable => Command::Disable {
                name: fields.name()?,
            },
        };
        Ok(command)
    }

    pub fn verb(&self) -> Verb {
        match self {
            Command::Enable { .. } => Verb::Enable,
            Command::EnableRandom { .. } => Verb::EnableRandom,
            Command::Disable { .. } => Verb::Disable,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Command::Enable { name, .. }
            | Command::EnableRandom { name, .. }
            | Command::Disable { name } => name,
        }
    }

    /// Apply this command to `registry`.
    pub fn apply(&self, registry: &Registry) {
        match self {
            Command::Enable {
                name,
                failnum,
                failinfo,
                onetime,
            } => {
                if let Some(point) = FailurePoint::new(name.as_str()) {
                    registry.register(
                        point
                            .with_fail_code(*failnum)
                            .with_fail_info(*failinfo)
                            .with_onetime(*onetime),
                    );
                }
            }
            Command::EnableRandom {
                name,
                probability,
                failnum,
                failinfo,
                onetime,
            } => {
                if let Some(point) = FailurePoint::new(name.as_str()) {
                    registry.register(
                        point
                            .with_mode(Mode::random(*probability))
                            .with_fail_code(*failnum)
                            .with_fail_info(*failinfo)
                            .with_onetime(*onetime),
                    );
                }
            }
            Command::Disable { name } => {
                registry.unregister(name);
            }
        }
    }
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::parse(s)
    }
}

/// Renders the wire form, without the trailing newline.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}={}", self.verb().as_str(), KEY_NAME, self.name())?;
        let (probability, failnum, failinfo, onetime) = match self {
            Command::Enable {
                failnum,
                failinfo,
                onetime,
                ..
            } => (None, *failnum, *failinfo, *onetime),
            Command::EnableRandom {
                probability,
                failnum,
                failinfo,
                onetime,
                ..
            } => (Some(*probability), *failnum, *failinfo, *onetime),
            Command::Disable { .. } => return Ok(()),
        };
        if let Some(p) = probability {
            write!(f, ",{}={}", KEY_PROBABILITY, p)?;
        }
        if failnum != DEFAULT_FAIL_CODE {
            write!(f, ",{}={}", KEY_FAILNUM, failnum)?;
        }
        if !failinfo.is_none() {
            write!(f, ",{}={}", KEY_FAILINFO, failinfo)?;
        }
        if onetime {
            write!(f, ",{}", FLAG_ONETIME)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enable(name: &str) -> Command {
        Command::Enable {
            name: name.to_string(),
            failnum: DEFAULT_FAIL_CODE,
            failinfo: FailInfo::NONE,
            onetime: false,
        }
    }

    #[test]
    fn test_parse_enable_defaults() {
        assert_eq!(
            Command::parse("enable name=posix/io/read").unwrap(),
            enable("posix/io/read")
        );
    }

    #[test]
    fn test_parse_enable_full() {
        let cmd = Command::parse("enable name=posix/io/*,failnum=-4,failinfo=12,onetime\n").unwrap();
        assert_eq!(
            cmd,
            Command::Enable {
                name: "posix/io/*".to_string(),
                failnum: -4,
                failinfo: FailInfo::new(12),
                onetime: true,
            }
        );
    }

    #[test]
    fn test_parse_enable_random() {
        let cmd = Command::parse("enable_random name=libc/mm/*,probability=0.25,failinfo=none")
            .unwrap();
        assert_eq!(
            cmd,
            Command::EnableRandom {
                name: "libc/mm/*".to_string(),
                probability: 0.25,
                failnum: 1,
                failinfo: FailInfo::NONE,
                onetime: false,
            }
        );
    }

    #[test]
    fn test_parse_disable() {
        assert_eq!(
            Command::parse("disable name=posix/io/read\r\n").unwrap(),
            Command::Disable {
                name: "posix/io/read".to_string()
            }
        );
    }

    #[test]
    fn test_probability_out_of_range_is_clamped() {
        let cmd = Command::parse("enable_random name=x,probability=3").unwrap();
        assert!(matches!(cmd, Command::EnableRandom { probability, .. } if probability == 1.0));

        let cmd = Command::parse("enable_random name=x,probability=-1").unwrap();
        assert!(matches!(cmd, Command::EnableRandom { probability, .. } if probability == 0.0));
    }

    #[test]
    fn test_malformed_lines() {
        let cases: &[(&str, ParseError)] = &[
            ("", ParseError::Empty),
            ("\n", ParseError::Empty),
            ("enable", ParseError::MissingParams("enable".to_string())),
            ("frobnicate name=x", ParseError::UnknownVerb("frobnicate".to_string())),
            ("frobnicate", ParseError::UnknownVerb("frobnicate".to_string())),
            ("enable name=", ParseError::EmptyName),
            ("enable failnum=3", ParseError::MissingKey("name")),
            ("enable_random name=x", ParseError::MissingKey("probability")),
            ("enable name", ParseError::MalformedParam("name".to_string())),
            ("enable name=x,,failnum=2", ParseError::MalformedParam(String::new())),
            ("enable =x", ParseError::MalformedParam("=x".to_string())),
            ("enable name=x,failnum=0", ParseError::ZeroFailnum),
            ("enable name=a,name=b", ParseError::DuplicateKey("name".to_string())),
            (
                "enable name=x,onetime,onetime",
                ParseError::DuplicateKey("onetime".to_string()),
            ),
            (
                "disable name=x,failnum=2",
                ParseError::UnexpectedKey {
                    verb: "disable".to_string(),
                    key: "failnum".to_string(),
                },
            ),
            (
                "enable name=x,probability=0.5",
                ParseError::UnexpectedKey {
                    verb: "enable".to_string(),
                    key: "probability".to_string(),
                },
            ),
            (
                "enable name=x,failnum=abc",
                ParseError::InvalidValue {
                    key: "failnum",
                    value: "abc".to_string(),
                },
            ),
            (
                "enable name=x,failinfo=-1",
                ParseError::InvalidValue {
                    key: "failinfo",
                    value: "-1".to_string(),
                },
            ),
            (
                "enable_random name=x,probability=NaN",
                ParseError::InvalidValue {
                    key: "probability",
                    value: "NaN".to_string(),
                },
            ),
            (
                "enable_random name=x,probability=half",
                ParseError::InvalidValue {
                    key: "probability",
                    value: "half".to_string(),
                },
            ),
        ];

        for (line, expected) in cases {
            assert_eq!(&Command::parse(line).unwrap_err(), expected, "line: {:?}", line);
        }
    }

    #[test]
    fn test_oversize_line_rejected() {
        let line = format!("enable name={}", "a".repeat(MAX_LINE_LEN));
        assert_eq!(Command::parse(&line).unwrap_err(), ParseError::TooLong);
    }

    #[test]
    fn test_names_are_not_trimmed() {
        let cmd = Command::parse("enable name= spaced ").unwrap();
        assert_eq!(cmd.name(), " spaced ");
    }

    #[test]
    fn test_value_may_contain_equals() {
        let cmd = Command::parse("disable name=a=b").unwrap();
        assert_eq!(cmd.name(), "a=b");
    }

    #[test]
    fn test_display_is_parseable() {
        let cmd = Command::EnableRandom {
            name: "posix/io/*".to_string(),
            probability: 0.5,
            failnum: 3,
            failinfo: FailInfo::new(8),
            onetime: true,
        };
        let line = cmd.to_string();
        assert_eq!(
            line,
            "enable_random name=posix/io/*,probability=0.5,failnum=3,failinfo=8,onetime"
        );
        assert_eq!(Command::parse(&line).unwrap(), cmd);
        assert_eq!(enable("a").to_string(), "enable name=a");
    }

    #[test]
    fn test_apply() {
        let registry = Registry::new();
        Command::parse("enable_random name=a/*,probability=0.5,failnum=2")
            .unwrap()
            .apply(&registry);
        let point = registry.get("a/*").unwrap();
        assert_eq!(point.mode().probability(), Some(0.5));
        assert_eq!(point.fail_code(), 2);

        Command::parse("disable name=a/*").unwrap().apply(&registry);
        assert!(registry.is_empty());
    }
}
