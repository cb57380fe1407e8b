//! Go text/template to minijinja translation
//!
//! Blueprint arguments are Go templates (`{{ .StatefulSet.Name }}`). They are
//! parsed here and re-emitted as minijinja source in which every field
//! access, truth test and printed value goes through a registered helper, so
//! Go lookup, truthiness and `%v` printing rules hold while minijinja does
//! the evaluation. Literal text is wrapped in raw blocks so shell snippets
//! such as `${#ARR[@]}` never reach the minijinja lexer.

use super::error::TemplateError;
use super::functions::is_known_function;

/// Variable holding the root data in translated templates
pub(crate) const ROOT_VAR: &str = "__root";
/// Prefix under which template functions are registered
pub(crate) const FN_PREFIX: &str = "__fn_";
/// Helper resolving a field chain: `__go_field(value, "A", "B")`
pub(crate) const FIELD_FN: &str = "__go_field";
/// Helper producing `[key, value]` pairs for `range`
pub(crate) const RANGE_FN: &str = "__go_range";
/// Helper applying Go truthiness
pub(crate) const TRUTH_FN: &str = "__go_truth";
/// Helper printing a value with `%v` semantics
pub(crate) const EMIT_FN: &str = "__go_emit";

/// Translate a Go template into minijinja source
pub(crate) fn translate(src: &str) -> Result<String, TemplateError> {
    let items = scan(src)?;
    let mut parser = Parser {
        items: items.into_iter(),
    };
    let (nodes, stop) = parser.parse_list()?;
    match stop {
        Stop::Eof => {}
        Stop::End => return Err(syntax("unexpected {{end}}")),
        Stop::Else(_) => return Err(syntax("unexpected {{else}}")),
    }

    let mut emitter = Emitter {
        out: String::with_capacity(src.len() * 2),
        next_id: 0,
        scopes: vec![Vec::new()],
    };
    emitter.nodes(&nodes, ROOT_VAR)?;
    Ok(emitter.out)
}

fn syntax(msg: impl Into<String>) -> TemplateError {
    TemplateError::Syntax(msg.into())
}

// =============================================================================
// Lexer
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Dot,
    Field(String),
    Var(String),
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Nil,
    LParen,
    RParen,
    Pipe,
    Comma,
    Declare,
    Assign,
}

#[derive(Clone, Debug)]
struct Token {
    tok: Tok,
    start: usize,
    end: usize,
}

enum Item {
    Text(String),
    Action(Vec<Token>),
}

struct Action {
    tokens: Vec<Token>,
    end: usize,
    trim_right: bool,
    comment: bool,
}

fn is_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\r' | '\n')
}

fn skip_space(src: &str, from: usize) -> usize {
    src[from..]
        .char_indices()
        .find(|(_, c)| !is_space(*c))
        .map_or(src.len(), |(i, _)| from + i)
}

fn ident_len(s: &str) -> usize {
    s.char_indices()
        .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
        .map_or(s.len(), |(i, _)| i)
}

fn starts_ident(s: &str) -> bool {
    s.starts_with(|c: char| c.is_alphabetic() || c == '_')
}

/// `{{- ` and ` -}}` trim markers need whitespace next to the dash
fn is_left_trim(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next() == Some('-') && chars.next().is_some_and(is_space)
}

fn push_text(items: &mut Vec<Item>, text: &str, trim_start: bool, trim_end: bool) {
    let mut text = text;
    if trim_start {
        text = text.trim_start_matches(is_space);
    }
    if trim_end {
        text = text.trim_end_matches(is_space);
    }
    if !text.is_empty() {
        items.push(Item::Text(text.to_string()));
    }
}

fn scan(src: &str) -> Result<Vec<Item>, TemplateError> {
    let mut items = Vec::new();
    let mut pos = 0;
    let mut trim_leading = false;
    loop {
        let Some(offset) = src[pos..].find("{{") else {
            push_text(&mut items, &src[pos..], trim_leading, false);
            return Ok(items);
        };
        let open = pos + offset;
        let mut inner = open + 2;
        let trim_trailing = is_left_trim(&src[inner..]);
        if trim_trailing {
            inner += 1;
        }
        push_text(&mut items, &src[pos..open], trim_leading, trim_trailing);

        let action = lex_action(src, inner)?;
        if !action.comment {
            if action.tokens.is_empty() {
                return Err(syntax("missing value for command"));
            }
            items.push(Item::Action(action.tokens));
        }
        trim_leading = action.trim_right;
        pos = action.end;
    }
}

fn lex_action(src: &str, start: usize) -> Result<Action, TemplateError> {
    let mut i = skip_space(src, start);

    if src[i..].starts_with("/*") {
        let close = src[i + 2..]
            .find("*/")
            .ok_or_else(|| syntax("unclosed comment"))?;
        let after_comment = i + 2 + close + 2;
        let next = skip_space(src, after_comment);
        let (end, trim_right) = if next > after_comment && src[next..].starts_with("-}}") {
            (next + 3, true)
        } else if src[after_comment..].starts_with("}}") {
            (after_comment + 2, false)
        } else {
            return Err(syntax("comment ends before closing delimiter"));
        };
        return Ok(Action {
            tokens: Vec::new(),
            end,
            trim_right,
            comment: true,
        });
    }

    let mut tokens = Vec::new();
    loop {
        let next = skip_space(src, i);
        let had_space = next > i;
        i = next;
        let rest = &src[i..];
        let Some(c) = rest.chars().next() else {
            return Err(syntax("unclosed action"));
        };
        if rest.starts_with("}}") {
            return Ok(Action {
                tokens,
                end: i + 2,
                trim_right: false,
                comment: false,
            });
        }
        if had_space && rest.starts_with("-}}") {
            return Ok(Action {
                tokens,
                end: i + 3,
                trim_right: true,
                comment: false,
            });
        }

        let (tok, len) = match c {
            '"' => lex_quoted(rest)?,
            '`' => {
                let close = rest[1..]
                    .find('`')
                    .ok_or_else(|| syntax("unterminated raw quoted string"))?;
                (Tok::Str(rest[1..1 + close].to_string()), close + 2)
            }
            '\'' => lex_char(rest)?,
            '(' => (Tok::LParen, 1),
            ')' => (Tok::RParen, 1),
            '|' => (Tok::Pipe, 1),
            ',' => (Tok::Comma, 1),
            ':' if rest.starts_with(":=") => (Tok::Declare, 2),
            '=' => (Tok::Assign, 1),
            '$' => {
                let n = ident_len(&rest[1..]);
                (Tok::Var(rest[1..1 + n].to_string()), 1 + n)
            }
            '.' if starts_ident(&rest[1..]) => {
                let n = ident_len(&rest[1..]);
                (Tok::Field(rest[1..1 + n].to_string()), 1 + n)
            }
            '.' if rest[1..].starts_with(|c: char| c.is_ascii_digit()) => lex_number(rest)?,
            '.' => (Tok::Dot, 1),
            c if c.is_ascii_digit() || c == '-' || c == '+' => lex_number(rest)?,
            c if c.is_alphabetic() || c == '_' => {
                let n = ident_len(rest);
                let tok = match &rest[..n] {
                    "true" => Tok::Bool(true),
                    "false" => Tok::Bool(false),
                    "nil" => Tok::Nil,
                    word => Tok::Ident(word.to_string()),
                };
                (tok, n)
            }
            other => return Err(syntax(format!("unexpected {:?} in action", other))),
        };
        tokens.push(Token {
            tok,
            start: i,
            end: i + len,
        });
        i += len;
    }
}

fn lex_quoted(s: &str) -> Result<(Tok, usize), TemplateError> {
    let mut out = String::new();
    let mut chars = s.char_indices().skip(1);
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((Tok::Str(out), i + 1)),
            '\n' => break,
            '\\' => {
                let (_, esc) = chars
                    .next()
                    .ok_or_else(|| syntax("unterminated quoted string"))?;
                let unescaped = match esc {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    'a' => '\x07',
                    'b' => '\x08',
                    'f' => '\x0c',
                    'v' => '\x0b',
                    '\\' | '"' | '\'' => esc,
                    'x' => read_hex(&mut chars, 2)?,
                    'u' => read_hex(&mut chars, 4)?,
                    'U' => read_hex(&mut chars, 8)?,
                    other => {
                        return Err(syntax(format!("unknown escape sequence: \\{}", other)))
                    }
                };
                out.push(unescaped);
            }
            c => out.push(c),
        }
    }
    Err(syntax("unterminated quoted string"))
}

fn read_hex(
    chars: &mut impl Iterator<Item = (usize, char)>,
    digits: usize,
) -> Result<char, TemplateError> {
    let mut code = 0u32;
    for _ in 0..digits {
        let digit = chars
            .next()
            .and_then(|(_, c)| c.to_digit(16))
            .ok_or_else(|| syntax("invalid hex escape"))?;
        code = code * 16 + digit;
    }
    char::from_u32(code).ok_or_else(|| syntax("escape is not a valid code point"))
}

fn lex_char(s: &str) -> Result<(Tok, usize), TemplateError> {
    let mut chars = s.char_indices().skip(1);
    let value = match chars.next() {
        Some((_, '\\')) => match chars.next() {
            Some((_, 'n')) => '\n',
            Some((_, 't')) => '\t',
            Some((_, c @ ('\\' | '\''))) => c,
            _ => return Err(syntax("invalid character constant")),
        },
        Some((_, c)) if c != '\'' => c,
        _ => return Err(syntax("empty character constant")),
    };
    match chars.next() {
        Some((i, '\'')) => Ok((Tok::Int(i64::from(u32::from(value))), i + 1)),
        _ => Err(syntax("unterminated character constant")),
    }
}

fn lex_number(s: &str) -> Result<(Tok, usize), TemplateError> {
    let bytes = s.as_bytes();
    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let hex = s[end..].starts_with("0x") || s[end..].starts_with("0X");
    while end < bytes.len() {
        let b = bytes[end];
        let exponent_sign =
            matches!(b, b'+' | b'-') && !hex && end > 0 && matches!(bytes[end - 1], b'e' | b'E');
        if b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || exponent_sign {
            end += 1;
        } else {
            break;
        }
    }
    let text = s[..end].replace('_', "");
    parse_number(&text)
        .map(|tok| (tok, end))
        .ok_or_else(|| syntax(format!("bad number syntax: {:?}", &s[..end])))
}

fn parse_number(text: &str) -> Option<Tok> {
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    if let Some(hex) = unsigned
        .strip_prefix("0x")
        .or_else(|| unsigned.strip_prefix("0X"))
    {
        let value = i64::from_str_radix(hex, 16).ok()?;
        return Some(Tok::Int(if negative { -value } else { value }));
    }
    if let Ok(value) = text.parse::<i64>() {
        return Some(Tok::Int(value));
    }
    text.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(Tok::Float)
}

// =============================================================================
// Parser
// =============================================================================

#[derive(Debug)]
enum Node {
    Text(String),
    Output(Pipeline),
    If {
        cond: Pipeline,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
    Range {
        pipe: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
    With {
        pipe: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

#[derive(Debug)]
struct Pipeline {
    decl: Vec<String>,
    cmds: Vec<Command>,
}

#[derive(Debug)]
struct Command {
    operands: Vec<Operand>,
}

#[derive(Debug)]
struct Operand {
    term: Term,
    fields: Vec<String>,
}

#[derive(Debug)]
enum Term {
    Dot,
    Var(String),
    Func(String),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Nil,
    Paren(Box<Pipeline>),
}

enum Stop {
    Eof,
    End,
    Else(Vec<Token>),
}

struct Parser {
    items: std::vec::IntoIter<Item>,
}

impl Parser {
    fn parse_list(&mut self) -> Result<(Vec<Node>, Stop), TemplateError> {
        let mut nodes = Vec::new();
        while let Some(item) = self.items.next() {
            let tokens = match item {
                Item::Text(text) => {
                    nodes.push(Node::Text(text));
                    continue;
                }
                Item::Action(tokens) => tokens,
            };
            let keyword = match tokens.first().map(|t| &t.tok) {
                Some(Tok::Ident(word)) => word.as_str(),
                _ => "",
            };
            let rest = tokens.get(1..).unwrap_or_default();
            match keyword {
                "end" => {
                    if !rest.is_empty() {
                        return Err(syntax("unexpected tokens after {{end}}"));
                    }
                    return Ok((nodes, Stop::End));
                }
                "else" => return Ok((nodes, Stop::Else(rest.to_vec()))),
                "if" => nodes.push(self.parse_if(rest)?),
                "range" => nodes.push(self.parse_range(rest)?),
                "with" => nodes.push(self.parse_with(rest)?),
                "define" | "template" | "block" | "break" | "continue" => {
                    return Err(syntax(format!("{{{{{}}}}} is not supported", keyword)))
                }
                _ => nodes.push(Node::Output(parse_pipeline(&tokens, 1)?)),
            }
        }
        Ok((nodes, Stop::Eof))
    }

    fn parse_if(&mut self, tokens: &[Token]) -> Result<Node, TemplateError> {
        let cond = parse_pipeline(tokens, 1)?;
        let (then, stop) = self.parse_list()?;
        let otherwise = self.parse_else(stop, "if")?;
        Ok(Node::If {
            cond,
            then,
            otherwise,
        })
    }

    fn parse_range(&mut self, tokens: &[Token]) -> Result<Node, TemplateError> {
        let pipe = parse_pipeline(tokens, 2)?;
        let (body, stop) = self.parse_list()?;
        let otherwise = self.parse_else(stop, "range")?;
        Ok(Node::Range {
            pipe,
            body,
            otherwise,
        })
    }

    fn parse_with(&mut self, tokens: &[Token]) -> Result<Node, TemplateError> {
        let pipe = parse_pipeline(tokens, 1)?;
        let (body, stop) = self.parse_list()?;
        let otherwise = self.parse_else(stop, "with")?;
        Ok(Node::With {
            pipe,
            body,
            otherwise,
        })
    }

    /// `{{else if}}` and `{{else with}}` chain into a nested node that
    /// consumes the shared `{{end}}`
    fn parse_else(&mut self, stop: Stop, context: &str) -> Result<Vec<Node>, TemplateError> {
        let rest = match stop {
            Stop::End => return Ok(Vec::new()),
            Stop::Eof => {
                return Err(syntax(format!(
                    "unexpected EOF: missing {{{{end}}}} for {{{{{}}}}}",
                    context
                )))
            }
            Stop::Else(rest) => rest,
        };
        match rest.first().map(|t| &t.tok) {
            None => {
                let (nodes, stop) = self.parse_list()?;
                match stop {
                    Stop::End => Ok(nodes),
                    Stop::Eof => Err(syntax(format!(
                        "unexpected EOF: missing {{{{end}}}} for {{{{{}}}}}",
                        context
                    ))),
                    Stop::Else(_) => Err(syntax("expected {{end}}; found {{else}}")),
                }
            }
            Some(Tok::Ident(kw)) if kw == "if" && context == "if" => {
                Ok(vec![self.parse_if(&rest[1..])?])
            }
            Some(Tok::Ident(kw)) if kw == "with" && context == "with" => {
                Ok(vec![self.parse_with(&rest[1..])?])
            }
            Some(_) => Err(syntax(format!(
                "unexpected tokens after {{{{else}}}} in {{{{{}}}}}",
                context
            ))),
        }
    }
}

fn parse_pipeline(tokens: &[Token], max_decl: usize) -> Result<Pipeline, TemplateError> {
    let mut cursor = Cursor { tokens, pos: 0 };
    let pipe = cursor.pipeline(max_decl)?;
    if let Some(token) = cursor.peek() {
        return Err(syntax(format!("unexpected {:?} in command", token.tok)));
    }
    Ok(pipe)
}

struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(token)
    }

    fn pipeline(&mut self, max_decl: usize) -> Result<Pipeline, TemplateError> {
        let decl = self.declarations();
        if decl.len() > max_decl {
            return Err(syntax(if max_decl == 0 {
                "variable declaration not allowed here"
            } else {
                "too many declarations"
            }));
        }
        let mut cmds = vec![self.command()?];
        while matches!(self.peek().map(|t| &t.tok), Some(Tok::Pipe)) {
            self.pos += 1;
            cmds.push(self.command()?);
        }
        Ok(Pipeline { decl, cmds })
    }

    fn declarations(&mut self) -> Vec<String> {
        let tokens = self.tokens;
        let toks: Vec<&Tok> = tokens[self.pos..].iter().take(4).map(|t| &t.tok).collect();
        match toks.as_slice() {
            [Tok::Var(a), Tok::Declare | Tok::Assign, ..] => {
                self.pos += 2;
                vec![a.clone()]
            }
            [Tok::Var(a), Tok::Comma, Tok::Var(b), Tok::Declare | Tok::Assign] => {
                self.pos += 4;
                vec![a.clone(), b.clone()]
            }
            _ => Vec::new(),
        }
    }

    fn command(&mut self) -> Result<Command, TemplateError> {
        let mut operands = Vec::new();
        while let Some(token) = self.peek() {
            if matches!(token.tok, Tok::Pipe | Tok::RParen) {
                break;
            }
            operands.push(self.operand()?);
        }
        if operands.is_empty() {
            return Err(syntax("missing value for command"));
        }
        Ok(Command { operands })
    }

    fn operand(&mut self) -> Result<Operand, TemplateError> {
        let token = self.next().ok_or_else(|| syntax("missing value"))?;
        let mut fields = Vec::new();
        let term = match &token.tok {
            Tok::Dot => Term::Dot,
            Tok::Field(name) => {
                fields.push(name.clone());
                Term::Dot
            }
            Tok::Var(name) => Term::Var(name.clone()),
            Tok::Ident(name) => Term::Func(name.clone()),
            Tok::Str(s) => Term::Str(s.clone()),
            Tok::Int(i) => Term::Int(*i),
            Tok::Float(f) => Term::Float(*f),
            Tok::Bool(b) => Term::Bool(*b),
            Tok::Nil => Term::Nil,
            Tok::LParen => {
                let inner = self.pipeline(0)?;
                match self.next() {
                    Some(Token {
                        tok: Tok::RParen, ..
                    }) => {}
                    _ => return Err(syntax("unclosed left paren")),
                }
                Term::Paren(Box::new(inner))
            }
            other => return Err(syntax(format!("unexpected {:?} in operand", other))),
        };

        let mut end = self.tokens[self.pos - 1].end;
        while let Some(Token {
            tok: Tok::Field(name),
            start,
            end: field_end,
        }) = self.peek()
        {
            if *start != end {
                break;
            }
            if !matches!(term, Term::Dot | Term::Var(_) | Term::Paren(_)) {
                return Err(syntax(format!("unexpected .{} after term", name)));
            }
            fields.push(name.clone());
            end = *field_end;
            self.pos += 1;
        }
        Ok(Operand { term, fields })
    }
}

// =============================================================================
// Emitter
// =============================================================================

struct Emitter {
    out: String,
    next_id: usize,
    scopes: Vec<Vec<String>>,
}

fn var_name(name: &str) -> String {
    format!("__v_{}", name)
}

fn string_literal(s: &str) -> Result<String, TemplateError> {
    serde_json::to_string(s).map_err(|e| syntax(e.to_string()))
}

impl Emitter {
    fn block(&mut self, body: &str) {
        self.out.push_str("{% ");
        self.out.push_str(body);
        self.out.push_str(" %}");
    }

    fn declare(&mut self, name: &str, value: &str) {
        self.block(&format!("set {} = {}", var_name(name), value));
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(name.to_string());
        }
    }

    fn is_declared(&self, name: &str) -> bool {
        self.scopes.iter().any(|scope| scope.iter().any(|n| n == name))
    }

    fn fresh_id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn nodes(&mut self, nodes: &[Node], dot: &str) -> Result<(), TemplateError> {
        for node in nodes {
            self.node(node, dot)?;
        }
        Ok(())
    }

    fn node(&mut self, node: &Node, dot: &str) -> Result<(), TemplateError> {
        match node {
            Node::Text(text) => {
                if text.contains("endraw") {
                    // A raw block cannot hold its own terminator
                    self.out.push_str("{{ ");
                    self.out.push_str(&string_literal(text)?);
                    self.out.push_str(" }}");
                } else if text.contains('{') {
                    self.block("raw");
                    self.out.push_str(text);
                    self.block("endraw");
                } else {
                    self.out.push_str(text);
                }
            }
            Node::Output(pipe) => {
                let expr = self.pipeline(pipe, dot)?;
                match pipe.decl.first() {
                    Some(name) => self.declare(name, &expr),
                    None => {
                        self.out.push_str("{{ ");
                        self.out.push_str(&format!("{}({})", EMIT_FN, expr));
                        self.out.push_str(" }}");
                    }
                }
            }
            Node::If {
                cond,
                then,
                otherwise,
            } => {
                let expr = self.pipeline(cond, dot)?;
                self.scopes.push(Vec::new());
                let test = match cond.decl.first() {
                    Some(name) => {
                        self.declare(name, &expr);
                        var_name(name)
                    }
                    None => expr,
                };
                self.block(&format!("if {}({})", TRUTH_FN, test));
                self.nodes(then, dot)?;
                if !otherwise.is_empty() {
                    self.block("else");
                    self.nodes(otherwise, dot)?;
                }
                self.block("endif");
                self.scopes.pop();
            }
            Node::Range {
                pipe,
                body,
                otherwise,
            } => {
                let expr = self.pipeline(pipe, dot)?;
                let id = self.fresh_id();
                let key = format!("__key{}", id);
                let elem = format!("__dot{}", id);
                self.block(&format!("for {}, {} in {}({})", key, elem, RANGE_FN, expr));
                self.scopes.push(Vec::new());
                match pipe.decl.as_slice() {
                    [value] => self.declare(value, &elem),
                    [index, value] => {
                        self.declare(index, &key);
                        self.declare(value, &elem);
                    }
                    _ => {}
                }
                self.nodes(body, &elem)?;
                self.scopes.pop();
                if !otherwise.is_empty() {
                    self.block("else");
                    self.nodes(otherwise, dot)?;
                }
                self.block("endfor");
            }
            Node::With {
                pipe,
                body,
                otherwise,
            } => {
                let expr = self.pipeline(pipe, dot)?;
                let elem = format!("__dot{}", self.fresh_id());
                self.block(&format!("with {} = {}", elem, expr));
                self.block(&format!("if {}({})", TRUTH_FN, elem));
                self.scopes.push(Vec::new());
                if let Some(name) = pipe.decl.first() {
                    self.declare(name, &elem);
                }
                self.nodes(body, &elem)?;
                self.scopes.pop();
                if !otherwise.is_empty() {
                    self.block("else");
                    self.nodes(otherwise, dot)?;
                }
                self.block("endif");
                self.block("endwith");
            }
        }
        Ok(())
    }

    fn pipeline(&self, pipe: &Pipeline, dot: &str) -> Result<String, TemplateError> {
        let mut previous: Option<String> = None;
        for cmd in &pipe.cmds {
            previous = Some(self.command(cmd, dot, previous.take())?);
        }
        previous.ok_or_else(|| syntax("missing value for command"))
    }

    fn command(
        &self,
        cmd: &Command,
        dot: &str,
        piped: Option<String>,
    ) -> Result<String, TemplateError> {
        let (head, args) = cmd
            .operands
            .split_first()
            .ok_or_else(|| syntax("missing value for command"))?;

        if let Term::Func(name) = &head.term {
            check_function(name)?;
            let mut rendered = args
                .iter()
                .map(|arg| self.operand(arg, dot))
                .collect::<Result<Vec<_>, _>>()?;
            rendered.extend(piped);
            return Ok(format!("{}{}({})", FN_PREFIX, name, rendered.join(", ")));
        }

        if !args.is_empty() || piped.is_some() {
            return Err(syntax(format!(
                "can't give argument to non-function {:?}",
                head.term
            )));
        }
        self.operand(head, dot)
    }

    fn operand(&self, op: &Operand, dot: &str) -> Result<String, TemplateError> {
        let base = match &op.term {
            Term::Dot => dot.to_string(),
            Term::Var(name) if name.is_empty() => ROOT_VAR.to_string(),
            Term::Var(name) => {
                if !self.is_declared(name) {
                    return Err(syntax(format!("undefined variable \"${}\"", name)));
                }
                var_name(name)
            }
            Term::Func(name) => {
                check_function(name)?;
                format!("{}{}()", FN_PREFIX, name)
            }
            Term::Str(s) => string_literal(s)?,
            Term::Int(i) => i.to_string(),
            Term::Float(f) => format!("{:?}", f),
            Term::Bool(b) => b.to_string(),
            Term::Nil => "none".to_string(),
            Term::Paren(inner) => format!("({})", self.pipeline(inner, dot)?),
        };
        if op.fields.is_empty() {
            return Ok(base);
        }
        let names = op
            .fields
            .iter()
            .map(|f| string_literal(f))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!("{}({}, {})", FIELD_FN, base, names.join(", ")))
    }
}

fn check_function(name: &str) -> Result<(), TemplateError> {
    if is_known_function(name) {
        Ok(())
    } else {
        Err(syntax(format!("function \"{}\" not defined", name)))
    }
}
