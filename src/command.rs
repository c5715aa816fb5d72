//! Command grammar shared by the client (pre-flight) and the daemon (authoritative)

use std::collections::BTreeSet;
use std::fmt;

use chrono::NaiveDate;
use thiserror::Error;

/// Trailing flag asking the client to extract the archive after transfer
pub const EXTRACT_FLAG: &str = "-u";

/// Date format accepted by `dgetfiles`
pub const DATE_FORMAT: &str = "%Y-%m-%d";

const MAX_POSITIONAL: usize = 7;
const MAX_EXTENSIONS: usize = 6;
const MAX_EXTENSION_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    FindFile,
    SearchBySize,
    SearchByDate,
    SearchByExtension,
    SearchByName,
    Quit,
}

impl Verb {
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "findfile" => Some(Verb::FindFile),
            "sgetfiles" => Some(Verb::SearchBySize),
            "dgetfiles" => Some(Verb::SearchByDate),
            "gettargz" => Some(Verb::SearchByExtension),
            "getfiles" => Some(Verb::SearchByName),
            "quit" => Some(Verb::Quit),
            _ => None,
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Verb::FindFile => "findfile",
            Verb::SearchBySize => "sgetfiles",
            Verb::SearchByDate => "dgetfiles",
            Verb::SearchByExtension => "gettargz",
            Verb::SearchByName => "getfiles",
            Verb::Quit => "quit",
        }
    }

    pub fn usage(self) -> &'static str {
        match self {
            Verb::FindFile => "Usage: findfile <filename>",
            Verb::SearchBySize => "Usage: sgetfiles <size1> <size2> [-u]  (0 <= size1 <= size2)",
            Verb::SearchByDate => "Usage: dgetfiles <date1> <date2> [-u]  (YYYY-MM-DD, date1 <= date2)",
            Verb::SearchByExtension => "Usage: gettargz <ext1> ... <ext6> [-u]",
            Verb::SearchByName => "Usage: getfiles <file1> ... <file7> [-u]",
            Verb::Quit => "Usage: quit",
        }
    }

    /// Whether the daemon answers this verb with an archive transfer
    pub fn returns_archive(self) -> bool {
        matches!(
            self,
            Verb::SearchBySize | Verb::SearchByDate | Verb::SearchByExtension | Verb::SearchByName
        )
    }

    fn accepts_extract_flag(self) -> bool {
        self.returns_archive()
    }

    /// Inclusive bounds on positional arguments once `-u` is stripped
    fn arity(self) -> (usize, usize) {
        match self {
            Verb::FindFile => (1, 1),
            Verb::SearchBySize | Verb::SearchByDate => (2, 2),
            Verb::SearchByExtension | Verb::SearchByName => (1, MAX_POSITIONAL),
            Verb::Quit => (0, 0),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command {0:?}")]
    UnknownVerb(String),
    #[error("{verb} takes {min}..={max} arguments, got {got}")]
    Arity {
        verb: Verb,
        min: usize,
        max: usize,
        got: usize,
    },
    #[error("{verb} does not accept -u")]
    UnexpectedFlag { verb: Verb },
    #[error("-u must be the last token")]
    MisplacedFlag { verb: Verb },
    #[error("{0:?} is not a non-negative integer size")]
    InvalidSize(String),
    #[error("size1 must not exceed size2")]
    SizeOrder,
    #[error("{0:?} is not a YYYY-MM-DD date")]
    InvalidDate(String),
    #[error("date1 must not be after date2")]
    DateOrder,
    #[error("{0:?} is not a valid extension (1-5 characters)")]
    InvalidExtension(String),
    #[error("at most 6 distinct extensions are allowed")]
    TooManyExtensions,
}

impl CommandError {
    /// The verb the error relates to, when one was recognized
    pub fn verb(&self) -> Option<Verb> {
        match self {
            CommandError::Empty | CommandError::UnknownVerb(_) => None,
            CommandError::Arity { verb, .. }
            | CommandError::UnexpectedFlag { verb }
            | CommandError::MisplacedFlag { verb } => Some(*verb),
            CommandError::InvalidSize(_) | CommandError::SizeOrder => Some(Verb::SearchBySize),
            CommandError::InvalidDate(_) | CommandError::DateOrder => Some(Verb::SearchByDate),
            CommandError::InvalidExtension(_) | CommandError::TooManyExtensions => {
                Some(Verb::SearchByExtension)
            }
        }
    }

    /// Usage line for the offending verb, or the list of verbs
    pub fn usage(&self) -> &'static str {
        match self.verb() {
            Some(verb) => verb.usage(),
            None => "Commands: findfile, sgetfiles, dgetfiles, getfiles, gettargz, quit",
        }
    }
}

/// One parsed command line. Built once, consumed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: Verb,
    pub args: Vec<String>,
    pub extract_on_complete: bool,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut tokens = line.split_ascii_whitespace();
        let keyword = tokens.next().ok_or(CommandError::Empty)?;
        let verb = Verb::from_keyword(keyword)
            .ok_or_else(|| CommandError::UnknownVerb(keyword.to_string()))?;
        let mut args: Vec<String> = tokens.map(str::to_string).collect();

        let extract_on_complete = args.last().map(String::as_str) == Some(EXTRACT_FLAG);
        if extract_on_complete {
            if !verb.accepts_extract_flag() {
                return Err(CommandError::UnexpectedFlag { verb });
            }
            args.pop();
        }
        if args.iter().any(|a| a == EXTRACT_FLAG) {
            return Err(CommandError::MisplacedFlag { verb });
        }

        let (min, max) = verb.arity();
        if args.len() < min || args.len() > max {
            return Err(CommandError::Arity {
                verb,
                min,
                max,
                got: args.len(),
            });
        }

        let cmd = Command {
            verb,
            args,
            extract_on_complete,
        };
        // Typed checks live next to the accessors so both sides share them
        match verb {
            Verb::SearchBySize => {
                cmd.size_range()?;
            }
            Verb::SearchByDate => {
                cmd.date_range()?;
            }
            Verb::SearchByExtension => {
                cmd.extensions()?;
            }
            _ => {}
        }
        Ok(cmd)
    }

    /// `(min, max)` byte bounds of a `sgetfiles` command
    pub fn size_range(&self) -> Result<(u64, u64), CommandError> {
        let parse = |s: &String| {
            s.parse::<u64>()
                .map_err(|_| CommandError::InvalidSize(s.clone()))
        };
        let (min, max) = match self.args.as_slice() {
            [a, b] => (parse(a)?, parse(b)?),
            _ => return Err(self.arity_error()),
        };
        if min > max {
            return Err(CommandError::SizeOrder);
        }
        Ok((min, max))
    }

    /// `(from, to)` calendar dates of a `dgetfiles` command
    pub fn date_range(&self) -> Result<(NaiveDate, NaiveDate), CommandError> {
        let parse = |s: &String| {
            NaiveDate::parse_from_str(s, DATE_FORMAT)
                .map_err(|_| CommandError::InvalidDate(s.clone()))
        };
        let (from, to) = match self.args.as_slice() {
            [a, b] => (parse(a)?, parse(b)?),
            _ => return Err(self.arity_error()),
        };
        if from > to {
            return Err(CommandError::DateOrder);
        }
        Ok((from, to))
    }

    /// Normalized extension set of a `gettargz` command (leading `.` dropped)
    pub fn extensions(&self) -> Result<BTreeSet<String>, CommandError> {
        let mut set = BTreeSet::new();
        for raw in &self.args {
            let ext = raw.strip_prefix('.').unwrap_or(raw);
            if ext.is_empty() || ext.chars().count() > MAX_EXTENSION_LEN || ext.contains('/') {
                return Err(CommandError::InvalidExtension(raw.clone()));
            }
            set.insert(ext.to_string());
        }
        if set.len() > MAX_EXTENSIONS {
            return Err(CommandError::TooManyExtensions);
        }
        Ok(set)
    }

    fn arity_error(&self) -> CommandError {
        let (min, max) = self.verb.arity();
        CommandError::Arity {
            verb: self.verb,
            min,
            max,
            got: self.args.len(),
        }
    }

    /// Canonical single-line wire form, `\n` terminated
    pub fn to_line(&self) -> String {
        let mut line = String::from(self.verb.keyword());
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        if self.extract_on_complete {
            line.push(' ');
            line.push_str(EXTRACT_FLAG);
        }
        line.push('\n');
        line
    }
}
