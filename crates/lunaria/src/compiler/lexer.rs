// Streaming tokenizer: one token of lookahead, byte-oriented, tracking
// line numbers for the code generator's debug info.

use crate::compiler::token::Token;
use crate::value::convert::{self, Number};
use smol_str::SmolStr;

pub struct Lexer<'s> {
    src: &'s [u8],
    pos: usize,
    pub line: u32,
    pub chunk_name: String,

    pub token: Token,
    pub token_line: u32,
    ahead: Option<(Token, u32)>,
}

pub type LexResult<T> = Result<T, String>;

impl<'s> Lexer<'s> {
    pub fn new(source: &'s str, chunk_name: &str) -> LexResult<Self> {
        let mut lx = Lexer {
            src: source.as_bytes(),
            pos: 0,
            line: 1,
            chunk_name: chunk_name.to_string(),
            token: Token::Eof,
            token_line: 1,
            ahead: None,
        };
        // Skip a leading shebang line, as the standalone loader does.
        if lx.src.starts_with(b"#") {
            while lx.pos < lx.src.len() && lx.src[lx.pos] != b'\n' {
                lx.pos += 1;
            }
        }
        lx.bump()?;
        Ok(lx)
    }

    pub fn error(&self, msg: impl std::fmt::Display) -> String {
        format!("{}:{}: {}", self.chunk_name, self.line, msg)
    }

    pub fn error_near(&self, msg: impl std::fmt::Display) -> String {
        format!("{}:{}: {} near {}", self.chunk_name, self.token_line, msg, self.token.describe())
    }

    /// Advances to the next token.
    pub fn bump(&mut self) -> LexResult<()> {
        if let Some((t, ln)) = self.ahead.take() {
            self.token = t;
            self.token_line = ln;
            return Ok(());
        }
        let t = self.scan()?;
        self.token_line = self.line;
        self.token = t;
        Ok(())
    }

    /// One-token lookahead without consuming.
    pub fn peek(&mut self) -> LexResult<&Token> {
        if self.ahead.is_none() {
            let t = self.scan()?;
            self.ahead = Some((t, self.line));
        }
        Ok(&self.ahead.as_ref().unwrap().0)
    }

    // ---- character helpers ----

    #[inline]
    fn cur(&self) -> u8 {
        if self.pos < self.src.len() { self.src[self.pos] } else { 0 }
    }

    #[inline]
    fn at(&self, off: usize) -> u8 {
        if self.pos + off < self.src.len() { self.src[self.pos + off] } else { 0 }
    }

    #[inline]
    fn advance(&mut self) {
        self.pos += 1;
    }

    fn newline(&mut self) {
        // \n, \r, \r\n, \n\r all count as one line break.
        let first = self.cur();
        self.advance();
        let second = self.cur();
        if (second == b'\n' || second == b'\r') && second != first {
            self.advance();
        }
        self.line += 1;
    }

    // ---- scanning ----

    fn scan(&mut self) -> LexResult<Token> {
        loop {
            match self.cur() {
                0 if self.pos >= self.src.len() => return Ok(Token::Eof),
                b'\n' | b'\r' => self.newline(),
                b' ' | b'\t' | 0x0b | 0x0c => self.advance(),
                b'-' => {
                    if self.at(1) != b'-' {
                        self.advance();
                        return Ok(Token::Minus);
                    }
                    self.advance();
                    self.advance();
                    if self.cur() == b'[' {
                        if let Some(level) = self.long_bracket_level() {
                            self.read_long_string(level)?;
                            continue;
                        }
                    }
                    while self.pos < self.src.len() && self.cur() != b'\n' && self.cur() != b'\r' {
                        self.advance();
                    }
                }
                b'[' => {
                    if let Some(level) = self.long_bracket_level() {
                        let s = self.read_long_string(level)?;
                        return Ok(Token::Str(s));
                    }
                    self.advance();
                    return Ok(Token::LBracket);
                }
                b'=' => {
                    self.advance();
                    if self.cur() == b'=' {
                        self.advance();
                        return Ok(Token::Eq);
                    }
                    return Ok(Token::Assign);
                }
                b'<' => {
                    self.advance();
                    return Ok(match self.cur() {
                        b'=' => {
                            self.advance();
                            Token::Le
                        }
                        b'<' => {
                            self.advance();
                            Token::Shl
                        }
                        _ => Token::Lt,
                    });
                }
                b'>' => {
                    self.advance();
                    return Ok(match self.cur() {
                        b'=' => {
                            self.advance();
                            Token::Ge
                        }
                        b'>' => {
                            self.advance();
                            Token::Shr
                        }
                        _ => Token::Gt,
                    });
                }
                b'/' => {
                    self.advance();
                    if self.cur() == b'/' {
                        self.advance();
                        return Ok(Token::DSlash);
                    }
                    return Ok(Token::Slash);
                }
                b'~' => {
                    self.advance();
                    if self.cur() == b'=' {
                        self.advance();
                        return Ok(Token::Ne);
                    }
                    return Ok(Token::Tilde);
                }
                b':' => {
                    self.advance();
                    if self.cur() == b':' {
                        self.advance();
                        return Ok(Token::DColon);
                    }
                    return Ok(Token::Colon);
                }
                b'"' | b'\'' => return self.read_string(),
                b'.' => {
                    if self.at(1).is_ascii_digit() {
                        return self.read_number();
                    }
                    self.advance();
                    if self.cur() == b'.' {
                        self.advance();
                        if self.cur() == b'.' {
                            self.advance();
                            return Ok(Token::Dots);
                        }
                        return Ok(Token::Concat);
                    }
                    return Ok(Token::Dot);
                }
                c if c.is_ascii_digit() => return self.read_number(),
                c if c == b'_' || c.is_ascii_alphabetic() => {
                    let start = self.pos;
                    while {
                        let c = self.cur();
                        c == b'_' || c.is_ascii_alphanumeric()
                    } {
                        self.advance();
                    }
                    let name = std::str::from_utf8(&self.src[start..self.pos])
                        .map_err(|_| self.error("invalid identifier encoding"))?;
                    return Ok(match Token::keyword_of(name) {
                        Some(kw) => kw,
                        None => Token::Name(SmolStr::new(name)),
                    });
                }
                c => {
                    self.advance();
                    return Ok(match c {
                        b'+' => Token::Plus,
                        b'*' => Token::Star,
                        b'%' => Token::Percent,
                        b'^' => Token::Caret,
                        b'#' => Token::Hash,
                        b'&' => Token::Amp,
                        b'|' => Token::Pipe,
                        b'(' => Token::LParen,
                        b')' => Token::RParen,
                        b'{' => Token::LBrace,
                        b'}' => Token::RBrace,
                        b']' => Token::RBracket,
                        b';' => Token::Semi,
                        b',' => Token::Comma,
                        _ => {
                            return Err(self.error(format!(
                                "unexpected symbol near '{}'",
                                c as char
                            )));
                        }
                    });
                }
            }
        }
    }

    /// `[`, `[=`, `[==`... at the cursor: Some(level) when a long bracket
    /// opens here. Does not consume unless it matches.
    fn long_bracket_level(&mut self) -> Option<usize> {
        debug_assert_eq!(self.cur(), b'[');
        let mut off = 1;
        while self.at(off) == b'=' {
            off += 1;
        }
        if self.at(off) == b'[' {
            self.pos += off + 1;
            Some(off - 1)
        } else {
            None
        }
    }

    fn read_long_string(&mut self, level: usize) -> LexResult<Vec<u8>> {
        // A newline right after the opening bracket is skipped.
        if self.cur() == b'\n' || self.cur() == b'\r' {
            self.newline();
        }
        let mut out = Vec::new();
        loop {
            match self.cur() {
                0 if self.pos >= self.src.len() => {
                    return Err(self.error("unfinished long string"));
                }
                b']' => {
                    let mut off = 1;
                    while self.at(off) == b'=' {
                        off += 1;
                    }
                    if off - 1 == level && self.at(off) == b']' {
                        self.pos += off + 1;
                        return Ok(out);
                    }
                    out.push(b']');
                    self.advance();
                }
                b'\n' | b'\r' => {
                    self.newline();
                    out.push(b'\n');
                }
                c => {
                    out.push(c);
                    self.advance();
                }
            }
        }
    }

    fn read_string(&mut self) -> LexResult<Token> {
        let quote = self.cur();
        self.advance();
        let mut out = Vec::new();
        loop {
            let c = self.cur();
            if self.pos >= self.src.len() {
                return Err(self.error("unfinished string"));
            }
            match c {
                b'\n' | b'\r' => return Err(self.error("unfinished string")),
                b'\\' => {
                    self.advance();
                    let e = self.cur();
                    match e {
                        b'n' => {
                            out.push(b'\n');
                            self.advance();
                        }
                        b't' => {
                            out.push(b'\t');
                            self.advance();
                        }
                        b'r' => {
                            out.push(b'\r');
                            self.advance();
                        }
                        b'a' => {
                            out.push(0x07);
                            self.advance();
                        }
                        b'b' => {
                            out.push(0x08);
                            self.advance();
                        }
                        b'f' => {
                            out.push(0x0c);
                            self.advance();
                        }
                        b'v' => {
                            out.push(0x0b);
                            self.advance();
                        }
                        b'\\' | b'"' | b'\'' => {
                            out.push(e);
                            self.advance();
                        }
                        b'\n' | b'\r' => {
                            self.newline();
                            out.push(b'\n');
                        }
                        b'x' => {
                            self.advance();
                            let mut v: u32 = 0;
                            for _ in 0..2 {
                                let d = (self.cur() as char)
                                    .to_digit(16)
                                    .ok_or_else(|| self.error("hexadecimal digit expected"))?;
                                v = v * 16 + d;
                                self.advance();
                            }
                            out.push(v as u8);
                        }
                        b'z' => {
                            self.advance();
                            while matches!(self.cur(), b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c) {
                                if self.cur() == b'\n' || self.cur() == b'\r' {
                                    self.newline();
                                } else {
                                    self.advance();
                                }
                            }
                        }
                        b'u' => {
                            self.advance();
                            if self.cur() != b'{' {
                                return Err(self.error("missing '{' in \\u{xxxx}"));
                            }
                            self.advance();
                            let mut v: u32 = 0;
                            while self.cur() != b'}' {
                                let d = (self.cur() as char)
                                    .to_digit(16)
                                    .ok_or_else(|| self.error("hexadecimal digit expected"))?;
                                v = v
                                    .checked_mul(16)
                                    .and_then(|v| v.checked_add(d))
                                    .ok_or_else(|| self.error("UTF-8 value too large"))?;
                                self.advance();
                            }
                            self.advance();
                            let ch = char::from_u32(v)
                                .ok_or_else(|| self.error("UTF-8 value too large"))?;
                            let mut buf = [0u8; 4];
                            out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                        }
                        d if d.is_ascii_digit() => {
                            let mut v: u32 = 0;
                            for _ in 0..3 {
                                if !self.cur().is_ascii_digit() {
                                    break;
                                }
                                v = v * 10 + (self.cur() - b'0') as u32;
                                self.advance();
                            }
                            if v > 255 {
                                return Err(self.error("decimal escape too large"));
                            }
                            out.push(v as u8);
                        }
                        _ => return Err(self.error("invalid escape sequence")),
                    }
                }
                c if c == quote => {
                    self.advance();
                    return Ok(Token::Str(out));
                }
                c => {
                    out.push(c);
                    self.advance();
                }
            }
        }
    }

    fn read_number(&mut self) -> LexResult<Token> {
        let start = self.pos;
        let hex = self.cur() == b'0' && matches!(self.at(1), b'x' | b'X');
        if hex {
            self.advance();
            self.advance();
        }
        let exp_chars: &[u8] = if hex { b"pP" } else { b"eE" };
        loop {
            let c = self.cur();
            if c.is_ascii_alphanumeric() || c == b'.' {
                self.advance();
                if exp_chars.contains(&c) && matches!(self.cur(), b'+' | b'-') {
                    self.advance();
                }
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.error("malformed number"))?;
        match convert::str_to_number(text) {
            Some(Number::Int(i)) => Ok(Token::Int(i)),
            Some(Number::Float(f)) => Ok(Token::Float(f)),
            None => Err(self.error(format!("malformed number near '{}'", text))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_tokens(src: &str) -> Vec<Token> {
        let mut lx = Lexer::new(src, "=test").unwrap();
        let mut out = Vec::new();
        while lx.token != Token::Eof {
            out.push(lx.token.clone());
            lx.bump().unwrap();
        }
        out
    }

    #[test]
    fn basic_tokens() {
        let toks = all_tokens("local x = 1 + 2.5 -- comment\nreturn x");
        assert_eq!(
            toks,
            vec![
                Token::Local,
                Token::Name(SmolStr::new("x")),
                Token::Assign,
                Token::Int(1),
                Token::Plus,
                Token::Float(2.5),
                Token::Return,
                Token::Name(SmolStr::new("x")),
            ]
        );
    }

    #[test]
    fn strings_and_escapes() {
        let toks = all_tokens(r#""a\n\116" 'q' [[raw
line]]"#);
        assert_eq!(
            toks,
            vec![
                Token::Str(b"a\nt".to_vec()),
                Token::Str(b"q".to_vec()),
                Token::Str(b"raw\nline".to_vec()),
            ]
        );
    }

    #[test]
    fn long_comments_and_levels() {
        let toks = all_tokens("--[==[ skip ]==] 1 [=[s]=]");
        assert_eq!(toks, vec![Token::Int(1), Token::Str(b"s".to_vec())]);
    }

    #[test]
    fn numbers() {
        let toks = all_tokens("0xff 1e2 3 .5");
        assert_eq!(
            toks,
            vec![Token::Int(255), Token::Float(100.0), Token::Int(3), Token::Float(0.5)]
        );
    }

    #[test]
    fn compound_symbols() {
        let toks = all_tokens("<< >> // .. ... :: ~= == <= >=");
        assert_eq!(
            toks,
            vec![
                Token::Shl,
                Token::Shr,
                Token::DSlash,
                Token::Concat,
                Token::Dots,
                Token::DColon,
                Token::Ne,
                Token::Eq,
                Token::Le,
                Token::Ge,
            ]
        );
    }

    #[test]
    fn line_tracking() {
        let mut lx = Lexer::new("a\nb\r\nc", "=test").unwrap();
        assert_eq!(lx.token_line, 1);
        lx.bump().unwrap();
        assert_eq!(lx.token_line, 2);
        lx.bump().unwrap();
        assert_eq!(lx.token_line, 3);
    }
}
