//! Nginx configuration tree
//!
//! A structured mirror of an nginx config file: named block contexts
//! holding directives, comments and child contexts. The parser covers the
//! plain nginx syntax (brace-delimited blocks, `;`-terminated directives,
//! `#` comments, quoted parameters without backslash escapes), and every
//! mutation primitive is idempotent so the same registry event can be
//! replayed without duplicating config.

use crate::error::{LunaError, LunaResult};

/// Comment text marking a context as owned by this process
pub const MANAGED_MARKER: &str = "managed by Luna";

/// Single configuration statement, e.g. `server 127.0.0.1:8080 weight=2;`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub name: String,
    pub params: Vec<String>,
}

impl Directive {
    /// Create new directive
    pub fn new(name: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// Upsert key of the directive alongside its name
    pub fn first_param(&self) -> Option<&str> {
        self.params.first().map(String::as_str)
    }
}

/// Named block with a value argument, e.g. `upstream backend { ... }`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Context {
    pub name: String,
    pub value: String,
    pub comments: Vec<String>,
    pub directives: Vec<Directive>,
    pub children: Vec<Context>,
}

impl Context {
    /// Create new context
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            comments: Vec::new(),
            directives: Vec::new(),
            children: Vec::new(),
        }
    }

    /// All direct children with the given block name
    pub fn get_contexts(&self, name: &str) -> Vec<&Context> {
        self.children.iter().filter(|c| c.name == name).collect()
    }

    /// Direct child with exactly this name and value
    pub fn find_context(&self, name: &str, value: &str) -> Option<&Context> {
        self.children
            .iter()
            .find(|c| c.name == name && c.value == value)
    }

    /// Child keyed by `(name, value)`, created only when absent
    pub fn add_context(&mut self, name: &str, value: &str) -> &mut Context {
        let position = match self
            .children
            .iter()
            .position(|c| c.name == name && c.value == value)
        {
            Some(position) => position,
            None => {
                self.children.push(Context::new(name, value));
                self.children.len() - 1
            }
        };
        &mut self.children[position]
    }

    /// Remove the child with exactly this name and value
    pub fn remove_context(&mut self, name: &str, value: &str) -> bool {
        match self
            .children
            .iter()
            .position(|c| c.name == name && c.value == value)
        {
            Some(position) => {
                self.children.remove(position);
                true
            }
            None => false,
        }
    }

    /// All directives with the given name
    pub fn get_directives(&self, name: &str) -> Vec<&Directive> {
        self.directives.iter().filter(|d| d.name == name).collect()
    }

    /// Upsert a directive keyed by `(name, first param)`
    ///
    /// A directive with the same name and first parameter has its parameter
    /// list replaced in place; otherwise the directive is appended.
    pub fn add_directive(&mut self, directive: Directive) {
        let key = directive.first_param().map(str::to_string);
        if let Some(existing) = self
            .directives
            .iter_mut()
            .find(|d| d.name == directive.name && d.first_param() == key.as_deref())
        {
            existing.params = directive.params;
            return;
        }
        self.directives.push(directive);
    }

    /// Replace the parameter list of the directive keyed by `(name, first param)`
    pub fn edit_directive(&mut self, name: &str, first_param: &str, params: Vec<String>) -> bool {
        if let Some(existing) = self
            .directives
            .iter_mut()
            .find(|d| d.name == name && d.first_param() == Some(first_param))
        {
            existing.params = params;
            return true;
        }
        false
    }

    /// Attach a comment to the context, at most once
    pub fn add_comment(&mut self, text: &str) {
        if !self.has_comment(text) {
            self.comments.push(text.to_string());
        }
    }

    pub fn has_comment(&self, text: &str) -> bool {
        self.comments.iter().any(|c| c == text)
    }
}

/// Parsed nginx configuration file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfFile {
    pub root: Context,
}

impl ConfFile {
    /// Parse nginx configuration text
    pub fn parse(input: &str) -> LunaResult<Self> {
        let tokens = lex(input)?;
        let mut iter = tokens.into_iter();
        let mut root = Context::default();
        parse_body(&mut iter, &mut root, true)?;
        Ok(Self { root })
    }

    /// Serialize the tree back to nginx configuration text
    ///
    /// Block arguments and directive parameters carrying lexer punctuation
    /// or whitespace are emitted quoted, so output parses back into the
    /// same tree.
    pub fn render(&self) -> String {
        let mut out = String::new();
        render_body(&self.root, 0, &mut out);
        out
    }

    /// Read and parse a configuration file
    pub async fn load(path: &str) -> LunaResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| LunaError::Io(format!("failed to read nginx config {}: {}", path, e)))?;
        Self::parse(&content)
    }

    /// Serialize the tree and write it to a configuration file
    pub async fn flush(&self, path: &str) -> LunaResult<()> {
        tokio::fs::write(path, self.render())
            .await
            .map_err(|e| LunaError::Io(format!("failed to write nginx config {}: {}", path, e)))
    }
}

enum Token {
    Word(String),
    Semi,
    Open,
    Close,
    Comment(String),
}

fn lex(input: &str) -> LunaResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            '#' => {
                chars.next();
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    text.push(c);
                    chars.next();
                }
                tokens.push(Token::Comment(text.trim().to_string()));
            }
            ';' => {
                chars.next();
                tokens.push(Token::Semi);
            }
            '{' => {
                chars.next();
                tokens.push(Token::Open);
            }
            '}' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut word = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some(c) => word.push(c),
                        None => {
                            return Err(LunaError::ConfigStructure(
                                "unterminated quoted string".to_string(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Word(word));
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, ';' | '{' | '}' | '#') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }

    Ok(tokens)
}

fn parse_body(
    tokens: &mut std::vec::IntoIter<Token>,
    context: &mut Context,
    is_root: bool,
) -> LunaResult<()> {
    let mut words: Vec<String> = Vec::new();

    loop {
        match tokens.next() {
            None => {
                if !is_root {
                    return Err(LunaError::ConfigStructure(
                        "unexpected end of file inside a block".to_string(),
                    ));
                }
                if !words.is_empty() {
                    return Err(LunaError::ConfigStructure(format!(
                        "unterminated directive '{}'",
                        words.join(" ")
                    )));
                }
                return Ok(());
            }
            Some(Token::Comment(text)) => context.comments.push(text),
            Some(Token::Word(word)) => words.push(word),
            Some(Token::Semi) => {
                if !words.is_empty() {
                    let name = words.remove(0);
                    context.directives.push(Directive {
                        name,
                        params: std::mem::take(&mut words),
                    });
                }
            }
            Some(Token::Open) => {
                if words.is_empty() {
                    return Err(LunaError::ConfigStructure(
                        "block opened without a name".to_string(),
                    ));
                }
                let name = words.remove(0);
                let value = words.join(" ");
                words.clear();
                let mut child = Context::new(&name, &value);
                parse_body(tokens, &mut child, false)?;
                context.children.push(child);
            }
            Some(Token::Close) => {
                if is_root {
                    return Err(LunaError::ConfigStructure(
                        "unbalanced closing brace".to_string(),
                    ));
                }
                if !words.is_empty() {
                    return Err(LunaError::ConfigStructure(format!(
                        "unterminated directive '{}'",
                        words.join(" ")
                    )));
                }
                return Ok(());
            }
        }
    }
}

fn render_body(context: &Context, depth: usize, out: &mut String) {
    let indent = "    ".repeat(depth);

    for comment in &context.comments {
        out.push_str(&indent);
        out.push_str("# ");
        out.push_str(comment);
        out.push('\n');
    }

    for directive in &context.directives {
        out.push_str(&indent);
        out.push_str(&directive.name);
        for param in &directive.params {
            out.push(' ');
            out.push_str(&quote_param(param));
        }
        out.push_str(";\n");
    }

    for child in &context.children {
        out.push_str(&indent);
        out.push_str(&child.name);
        for arg in child.value.split_whitespace() {
            out.push(' ');
            out.push_str(&quote_param(arg));
        }
        out.push_str(" {\n");
        render_body(child, depth + 1, out);
        out.push_str(&indent);
        out.push_str("}\n");
    }
}

fn quote_param(param: &str) -> String {
    let needs_quoting = param.is_empty()
        || param
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '#' | '"' | '\''));
    if !needs_quoting {
        return param.to_string();
    }
    if param.contains('"') {
        format!("'{}'", param)
    } else {
        format!("\"{}\"", param)
    }
}
