use crate::error::SearchError;
use crate::query::ast::{Q, RawConfig, RegexpQuery, Substring};

/// Parse a query string into a [`Q`] tree
///
/// Supported syntax:
/// - `foo bar` conjunction, `foo | bar` disjunction, `-foo` negation, `( )` grouping
/// - `"exact phrase"` and `re:/pattern/`
/// - `repo:<regex>`, `file:<text>`, `content:<text>`, `branch:<name>`
/// - `case:yes|no`, `public:yes|no`, `fork:yes|no|only`, `archived:yes|no|only`
///
/// An empty query matches everything.
pub fn parse_query(input: &str) -> Result<Q, SearchError> {
    let mut parser = QueryParser::new(input);
    parser.parse()
}

struct QueryParser<'a> {
    input: &'a str,
    pos: usize,
    case_sensitive: bool,
}

impl<'a> QueryParser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            case_sensitive: false,
        }
    }

    fn parse(&mut self) -> Result<Q, SearchError> {
        let root = self.parse_or()?;
        self.skip_whitespace();
        if !self.is_eof() {
            return Err(SearchError::InvalidQuery(format!(
                "unexpected {:?} at offset {}",
                self.remaining(),
                self.pos
            )));
        }
        let root = if self.case_sensitive {
            make_case_sensitive(root)?
        } else {
            root
        };
        Ok(root.simplify())
    }

    fn parse_or(&mut self) -> Result<Q, SearchError> {
        let mut nodes = vec![self.parse_and()?];

        self.skip_whitespace();
        while self.consume_char('|') {
            self.skip_whitespace();
            nodes.push(self.parse_and()?);
            self.skip_whitespace();
        }

        Ok(if nodes.len() == 1 {
            nodes.swap_remove(0)
        } else {
            Q::Or(nodes)
        })
    }

    fn parse_and(&mut self) -> Result<Q, SearchError> {
        let mut nodes = Vec::new();

        loop {
            self.skip_whitespace();

            if self.is_eof() || self.peek_char() == Some(')') || self.peek_char() == Some('|') {
                break;
            }

            nodes.push(self.parse_unary()?);
        }

        Ok(match nodes.len() {
            0 => Q::Const(true),
            1 => nodes.swap_remove(0),
            _ => Q::And(nodes),
        })
    }

    fn parse_unary(&mut self) -> Result<Q, SearchError> {
        self.skip_whitespace();

        if self.consume_char('-') {
            let inner = self.parse_primary()?;
            return Ok(Q::Not(Box::new(inner)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Q, SearchError> {
        self.skip_whitespace();

        if self.consume_char('(') {
            let node = self.parse_or()?;
            if !self.consume_char(')') {
                return Err(SearchError::InvalidQuery("unbalanced parenthesis".into()));
            }
            return Ok(node);
        }

        if self.peek_char() == Some('"') {
            return self.parse_phrase();
        }

        if self.remaining().starts_with("re:/") {
            return self.parse_regex();
        }

        self.parse_term()
    }

    fn parse_phrase(&mut self) -> Result<Q, SearchError> {
        self.consume_char('"');
        let start = self.pos;

        while !self.is_eof() && self.peek_char() != Some('"') {
            self.advance();
        }

        let phrase = &self.input[start..self.pos];
        self.consume_char('"');

        if phrase.is_empty() {
            return Ok(Q::Const(true));
        }
        Ok(Q::substring(phrase))
    }

    fn parse_regex(&mut self) -> Result<Q, SearchError> {
        // Skip "re:/"
        self.pos += 4;
        let start = self.pos;

        while !self.is_eof() && self.peek_char() != Some('/') {
            self.advance();
        }

        let pattern = &self.input[start..self.pos];
        self.consume_char('/');

        Ok(Q::Regexp(RegexpQuery::new(pattern, false)?))
    }

    fn parse_term(&mut self) -> Result<Q, SearchError> {
        let start = self.pos;

        while let Some(ch) = self.peek_char() {
            if ch.is_alphanumeric() || ch == '_' || ch == ':' {
                self.advance();
                if ch == ':' {
                    let field = &self.input[start..self.pos - 1];
                    return self.parse_field(field);
                }
            } else {
                break;
            }
        }

        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() || ch == '|' || ch == ')' || ch == '(' {
                break;
            }
            self.advance();
        }

        let word = &self.input[start..self.pos];
        if word.is_empty() {
            return Err(SearchError::InvalidQuery(format!(
                "unexpected {:?} at offset {}",
                self.remaining(),
                self.pos
            )));
        }
        Ok(Q::substring(word))
    }

    fn parse_field(&mut self, field: &str) -> Result<Q, SearchError> {
        let value_start = self.pos;

        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() || ch == '|' || ch == ')' {
                break;
            }
            self.advance();
        }

        let value = &self.input[value_start..self.pos];
        let field = field.to_lowercase();
        if value.is_empty() {
            return Err(SearchError::InvalidQuery(format!("missing value for {field}:")));
        }

        match field.as_str() {
            "repo" | "r" => Q::repo_regex(value),
            "file" | "f" => Ok(Q::Substring(Substring::file_name(value))),
            "content" => Ok(Q::Substring(Substring::content(value))),
            "branch" | "b" => Ok(Q::Branch(value.to_string())),
            "case" => {
                self.case_sensitive = parse_yes_no(&field, value)?;
                Ok(Q::Const(true))
            }
            "public" => Ok(Q::RawConfig(RawConfig(if parse_yes_no(&field, value)? {
                RawConfig::ONLY_PUBLIC
            } else {
                RawConfig::ONLY_PRIVATE
            }))),
            "fork" => tri_state(&field, value, RawConfig::NO_FORKS, RawConfig::ONLY_FORKS),
            "archived" => {
                tri_state(&field, value, RawConfig::NO_ARCHIVED, RawConfig::ONLY_ARCHIVED)
            }
            // Unknown field, treat as literal
            _ => Ok(Q::substring(format!("{field}:{value}"))),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek_char().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn consume_char(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn advance(&mut self) {
        if let Some(ch) = self.peek_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn remaining(&self) -> &str {
        &self.input[self.pos..]
    }
}

fn parse_yes_no(field: &str, value: &str) -> Result<bool, SearchError> {
    match value.to_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(SearchError::InvalidQuery(format!(
            "{field}: expects yes or no, got {value:?}"
        ))),
    }
}

/// `yes` keeps everything, `no` and `only` map to the given flags
fn tri_state(field: &str, value: &str, no: u8, only: u8) -> Result<Q, SearchError> {
    match value.to_lowercase().as_str() {
        "yes" => Ok(Q::Const(true)),
        "no" => Ok(Q::RawConfig(RawConfig(no))),
        "only" => Ok(Q::RawConfig(RawConfig(only))),
        _ => Err(SearchError::InvalidQuery(format!(
            "{field}: expects yes, no or only, got {value:?}"
        ))),
    }
}

fn make_case_sensitive(q: Q) -> Result<Q, SearchError> {
    Ok(match q {
        Q::Substring(mut s) => {
            s.case_sensitive = true;
            Q::Substring(s)
        }
        Q::Regexp(r) => {
            let mut rebuilt = RegexpQuery::new(r.regex.as_str(), true)?;
            rebuilt.file_name = r.file_name;
            rebuilt.content = r.content;
            Q::Regexp(rebuilt)
        }
        Q::And(children) => Q::And(
            children
                .into_iter()
                .map(make_case_sensitive)
                .collect::<Result<_, _>>()?,
        ),
        Q::Or(children) => Q::Or(
            children
                .into_iter()
                .map(make_case_sensitive)
                .collect::<Result<_, _>>()?,
        ),
        Q::Not(inner) => Q::Not(Box::new(make_case_sensitive(*inner)?)),
        other => other,
    })
}
