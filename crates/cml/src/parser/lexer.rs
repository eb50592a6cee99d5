//! The macro source tokenizer.
//!
//! Produces one token at a time with line/column tracking and arbitrary
//! pushback, which is what the single-pass parser leans on instead of a
//! token buffer. Keyword recognition goes through a strum-derived string
//! map; dotted class paths are produced as separate identifier and period
//! tokens so the parser can resolve prefixes incrementally.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::types::Intrinsic;

/// Reserved words of the macro language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum Kw {
    Abstract,
    ArrayOf,
    Begin,
    BeginDebug,
    Break,
    Case,
    Catch,
    Class,
    ClassPath,
    Const,
    Constructor,
    Default,
    Destructor,
    Directives,
    DoLoop,
    DoWhile,
    Else,
    ElseIf,
    EndCase,
    EndClass,
    EndConstructor,
    EndDebug,
    EndDestructor,
    EndDirectives,
    EndEnum,
    EndForEach,
    EndIf,
    EndImports,
    EndLiterals,
    EndLocals,
    EndMembers,
    EndMethod,
    EndMethods,
    EndSwitch,
    EndTry,
    EndTypes,
    EndWhile,
    Enum,
    FTCase,
    Final,
    ForEach,
    If,
    Imports,
    In,
    InOut,
    Literals,
    Locals,
    Members,
    Method,
    Methods,
    NonConst,
    NonFinal,
    Out,
    Overrides,
    Parent,
    ParentClass,
    Private,
    Public,
    Required,
    Rethrow,
    Return,
    Returns,
    Switch,
    This,
    Throw,
    True,
    False,
    Try,
    TypeCast,
    Types,
    VectorOf,
    While,
}

/// A numeric literal with its optional width suffix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumLit {
    Int { value: i128, suffix: Option<Intrinsic> },
    Float { value: f64, suffix: Option<Intrinsic> },
}

/// One lexed token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Kw(Kw),
    Ident(String),
    Num(NumLit),
    Str(String),
    CharLit(char),

    // the magic dollar names
    ExceptionRef,
    CurLineRef,
    CurClassNameRef,
    DynTypeRef,

    Semi,
    Comma,
    Colon,
    Period,
    OpenParen,
    CloseParen,
    OpenBracket,
    CloseBracket,

    Assign,
    Equal,
    NotEqual,
    LsThan,
    GtThan,
    LsThanEq,
    GtThanEq,
    Add,
    Subtract,
    Multiply,
    Divide,
    ModDiv,
    And,
    Or,
    Xor,
    LogAnd,
    LogOr,
    LogXor,
    Exclaim,
    Inc,
    Dec,
    AddEq,
    SubEq,
    MulEq,
    DivEq,
    ModEq,
    AndEq,
    OrEq,
    XorEq,

    Eof,
}

impl Token {
    /// Short human form for diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Kw(kw) => format!("'{kw}'"),
            Self::Ident(name) => format!("identifier '{name}'"),
            Self::Num(_) => "numeric literal".to_owned(),
            Self::Str(_) => "string literal".to_owned(),
            Self::CharLit(_) => "character literal".to_owned(),
            Self::Eof => "end of file".to_owned(),
            other => format!("{other:?}"),
        }
    }
}

/// A token with the position it started at.
#[derive(Debug, Clone, PartialEq)]
pub struct Lexed {
    pub token: Token,
    pub line: u32,
    pub col: u32,
}

/// Tokenizer over one class's source text.
pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
    pushed: Vec<Lexed>,
}

impl Lexer {
    #[must_use]
    pub fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            pushed: Vec::new(),
        }
    }

    /// Returns a token to be produced again by the next `next_token`.
    pub fn push_back(&mut self, token: Lexed) {
        self.pushed.push(token);
    }

    /// Produces the next token, with position. Lexical errors come back as
    /// `Err(message)` with the lexer already past the offending text.
    pub fn next_token(&mut self) -> Result<Lexed, String> {
        if let Some(token) = self.pushed.pop() {
            return Ok(token);
        }
        self.skip_noise()?;
        let (line, col) = (self.line, self.col);
        let token = self.scan()?;
        Ok(Lexed { token, line, col })
    }

    fn peek_char(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_char_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek_char()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    /// Skips whitespace and both comment forms.
    fn skip_noise(&mut self) -> Result<(), String> {
        loop {
            match self.peek_char() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek_char_at(1) == Some('/') => {
                    while let Some(c) = self.peek_char() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek_char_at(1) == Some('*') => {
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek_char() {
                            None => return Err("unterminated block comment".to_owned()),
                            Some('*') if self.peek_char_at(1) == Some('/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            _ => {
                                self.bump();
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn scan(&mut self) -> Result<Token, String> {
        let Some(ch) = self.peek_char() else {
            return Ok(Token::Eof);
        };

        if ch.is_ascii_alphabetic() || ch == '_' {
            return Ok(self.scan_word());
        }
        if ch.is_ascii_digit() {
            return self.scan_number();
        }

        match ch {
            '"' => self.scan_string(),
            '\'' => self.scan_char(),
            '$' => self.scan_dollar(),
            _ => self.scan_punct(),
        }
    }

    fn scan_word(&mut self) -> Token {
        let mut word = String::new();
        while let Some(c) = self.peek_char() {
            if c.is_ascii_alphanumeric() || c == '_' {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }
        match word.parse::<Kw>() {
            Ok(kw) => Token::Kw(kw),
            Err(_) => Token::Ident(word),
        }
    }

    fn scan_number(&mut self) -> Result<Token, String> {
        let mut text = String::new();
        let hex = self.peek_char() == Some('0') && matches!(self.peek_char_at(1), Some('x' | 'X'));
        if hex {
            self.bump();
            self.bump();
            while let Some(c) = self.peek_char() {
                if c.is_ascii_hexdigit() {
                    text.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
            if text.is_empty() {
                return Err("hex literal has no digits".to_owned());
            }
            let value = i128::from_str_radix(&text, 16).map_err(|_| format!("hex literal '0x{text}' is out of range"))?;
            let suffix = self.scan_suffix()?;
            return Ok(Token::Num(NumLit::Int { value, suffix }));
        }

        let mut is_float = false;
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else if c == '.' && !is_float && self.peek_char_at(1).is_some_and(|d| d.is_ascii_digit()) {
                is_float = true;
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let suffix = self.scan_suffix()?;
        if is_float || matches!(suffix, Some(Intrinsic::Float4 | Intrinsic::Float8)) {
            let value = text.parse::<f64>().map_err(|_| format!("bad float literal '{text}'"))?;
            Ok(Token::Num(NumLit::Float { value, suffix }))
        } else {
            let value = text.parse::<i128>().map_err(|_| format!("numeric literal '{text}' is out of range"))?;
            Ok(Token::Num(NumLit::Int { value, suffix }))
        }
    }

    /// The optional `#C4` style width suffix after a numeric literal.
    fn scan_suffix(&mut self) -> Result<Option<Intrinsic>, String> {
        if self.peek_char() != Some('#') {
            return Ok(None);
        }
        self.bump();
        let mut tag = String::new();
        while let Some(c) = self.peek_char() {
            if c.is_ascii_alphanumeric() {
                tag.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let suffix = match tag.as_str() {
            "C1" => Intrinsic::Card1,
            "C2" => Intrinsic::Card2,
            "C4" => Intrinsic::Card4,
            "C8" => Intrinsic::Card8,
            "I1" => Intrinsic::Int1,
            "I2" => Intrinsic::Int2,
            "I4" => Intrinsic::Int4,
            "F4" => Intrinsic::Float4,
            "F8" => Intrinsic::Float8,
            _ => return Err(format!("'#{tag}' is not a numeric type suffix")),
        };
        Ok(Some(suffix))
    }

    fn scan_escape(&mut self) -> Result<char, String> {
        match self.bump() {
            Some('n') => Ok('\n'),
            Some('r') => Ok('\r'),
            Some('t') => Ok('\t'),
            Some('0') => Ok('\0'),
            Some(c @ ('\\' | '"' | '\'')) => Ok(c),
            Some(c) => Err(format!("'\\{c}' is not a valid escape")),
            None => Err("source ends inside an escape".to_owned()),
        }
    }

    fn scan_string(&mut self) -> Result<Token, String> {
        self.bump();
        let mut text = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err("unterminated string literal".to_owned()),
                Some('"') => return Ok(Token::Str(text)),
                Some('\\') => text.push(self.scan_escape()?),
                Some(c) => text.push(c),
            }
        }
    }

    fn scan_char(&mut self) -> Result<Token, String> {
        self.bump();
        let ch = match self.bump() {
            None => return Err("unterminated character literal".to_owned()),
            Some('\\') => self.scan_escape()?,
            Some(c) => c,
        };
        match self.bump() {
            Some('\'') => Ok(Token::CharLit(ch)),
            _ => Err("unterminated character literal".to_owned()),
        }
    }

    fn scan_dollar(&mut self) -> Result<Token, String> {
        self.bump();
        let Token::Ident(name) = self.scan_word() else {
            return Err("'$' must start a special name".to_owned());
        };
        match name.as_str() {
            "Exception" => Ok(Token::ExceptionRef),
            "CurLine" => Ok(Token::CurLineRef),
            "CurClassName" => Ok(Token::CurClassNameRef),
            "DynTypeRef" => Ok(Token::DynTypeRef),
            other => Err(format!("'${other}' is not a special name")),
        }
    }

    fn scan_punct(&mut self) -> Result<Token, String> {
        let ch = self.bump().expect("caller peeked a char");
        let next = self.peek_char();
        let token = match (ch, next) {
            (':', Some('=')) => {
                self.bump();
                Token::Assign
            }
            (':', _) => Token::Colon,
            ('!', Some('=')) => {
                self.bump();
                Token::NotEqual
            }
            ('!', _) => Token::Exclaim,
            ('<', Some('=')) => {
                self.bump();
                Token::LsThanEq
            }
            ('<', _) => Token::LsThan,
            ('>', Some('=')) => {
                self.bump();
                Token::GtThanEq
            }
            ('>', _) => Token::GtThan,
            ('+', Some('+')) => {
                self.bump();
                Token::Inc
            }
            ('+', Some('=')) => {
                self.bump();
                Token::AddEq
            }
            ('+', _) => Token::Add,
            ('-', Some('-')) => {
                self.bump();
                Token::Dec
            }
            ('-', Some('=')) => {
                self.bump();
                Token::SubEq
            }
            ('-', _) => Token::Subtract,
            ('*', Some('=')) => {
                self.bump();
                Token::MulEq
            }
            ('*', _) => Token::Multiply,
            ('/', Some('=')) => {
                self.bump();
                Token::DivEq
            }
            ('/', _) => Token::Divide,
            ('%', Some('=')) => {
                self.bump();
                Token::ModEq
            }
            ('%', _) => Token::ModDiv,
            ('&', Some('&')) => {
                self.bump();
                Token::LogAnd
            }
            ('&', Some('=')) => {
                self.bump();
                Token::AndEq
            }
            ('&', _) => Token::And,
            ('|', Some('|')) => {
                self.bump();
                Token::LogOr
            }
            ('|', Some('=')) => {
                self.bump();
                Token::OrEq
            }
            ('|', _) => Token::Or,
            ('^', Some('^')) => {
                self.bump();
                Token::LogXor
            }
            ('^', Some('=')) => {
                self.bump();
                Token::XorEq
            }
            ('^', _) => Token::Xor,
            ('=', _) => Token::Equal,
            (';', _) => Token::Semi,
            (',', _) => Token::Comma,
            ('.', _) => Token::Period,
            ('(', _) => Token::OpenParen,
            (')', _) => Token::CloseParen,
            ('[', _) => Token::OpenBracket,
            (']', _) => Token::CloseBracket,
            (other, _) => return Err(format!("'{other}' is not part of the language")),
        };
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn all_tokens(src: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(src);
        let mut out = Vec::new();
        loop {
            let lexed = lexer.next_token().unwrap();
            let done = lexed.token == Token::Eof;
            out.push(lexed.token);
            if done {
                return out;
            }
        }
    }

    #[test]
    fn keywords_and_idents() {
        assert_eq!(
            all_tokens("Method Start Returns Int4"),
            vec![
                Token::Kw(Kw::Method),
                Token::Ident("Start".into()),
                Token::Kw(Kw::Returns),
                Token::Ident("Int4".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn numeric_literals_with_suffixes() {
        assert_eq!(
            all_tokens("10 0x1F#C2 2.5 7#I1 1.0#F4"),
            vec![
                Token::Num(NumLit::Int { value: 10, suffix: None }),
                Token::Num(NumLit::Int {
                    value: 31,
                    suffix: Some(Intrinsic::Card2)
                }),
                Token::Num(NumLit::Float { value: 2.5, suffix: None }),
                Token::Num(NumLit::Int {
                    value: 7,
                    suffix: Some(Intrinsic::Int1)
                }),
                Token::Num(NumLit::Float {
                    value: 1.0,
                    suffix: Some(Intrinsic::Float4)
                }),
                Token::Eof
            ]
        );
    }

    #[test]
    fn strings_and_escapes() {
        assert_eq!(
            all_tokens(r#""a\tb\"c" 'x' '\n'"#),
            vec![
                Token::Str("a\tb\"c".into()),
                Token::CharLit('x'),
                Token::CharLit('\n'),
                Token::Eof
            ]
        );
    }

    #[test]
    fn operators_longest_match() {
        assert_eq!(
            all_tokens(":= = != <= < && & ++ += ^^"),
            vec![
                Token::Assign,
                Token::Equal,
                Token::NotEqual,
                Token::LsThanEq,
                Token::LsThan,
                Token::LogAnd,
                Token::And,
                Token::Inc,
                Token::AddEq,
                Token::LogXor,
                Token::Eof
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            all_tokens("a // line\n /* block\n still */ b"),
            vec![Token::Ident("a".into()), Token::Ident("b".into()), Token::Eof]
        );
    }

    #[test]
    fn dollar_names() {
        assert_eq!(
            all_tokens("$Exception $CurLine $CurClassName $DynTypeRef"),
            vec![
                Token::ExceptionRef,
                Token::CurLineRef,
                Token::CurClassNameRef,
                Token::DynTypeRef,
                Token::Eof
            ]
        );
        let mut lexer = Lexer::new("$Bogus");
        assert!(lexer.next_token().is_err());
    }

    #[test]
    fn positions_track_lines() {
        let mut lexer = Lexer::new("a\n  b");
        let a = lexer.next_token().unwrap();
        let b = lexer.next_token().unwrap();
        assert_eq!((a.line, a.col), (1, 1));
        assert_eq!((b.line, b.col), (2, 3));
    }
}
