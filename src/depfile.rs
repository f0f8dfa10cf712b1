//! Parsing of Makefile syntax as found in `.d` files emitted by C compilers.
//!
//! The parser is event-style: each rule in the file produces a
//! `rule_start`/`rule_dependency`*/`rule_end` sequence on the supplied
//! actions, so the caller can register dependencies without materializing
//! the whole file.
//!
//! A backslash escapes a line break, continuing the dependency list;
//! anywhere else it is an ordinary path byte (Windows paths contain them).
//! Colons are also path bytes (drive letters), so the separator after a
//! rule's target is the colon ending its first token, or a free-standing
//! one right after it.

pub trait ParseActions {
    fn rule_start(&mut self, name: &str);
    fn rule_dependency(&mut self, path: &str);
    fn rule_end(&mut self);
    fn error(&mut self, message: &str, offset: usize);
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn byte(&self, at: usize) -> Option<u8> {
        self.buf.get(at).copied()
    }

    fn at_escaped_newline(&self) -> bool {
        self.byte(self.pos) == Some(b'\\')
            && matches!(self.byte(self.pos + 1), Some(b'\n' | b'\r'))
    }

    fn skip_escaped_newline(&mut self) {
        self.pos += 1;
        if self.byte(self.pos) == Some(b'\r') {
            self.pos += 1;
        }
        if self.byte(self.pos) == Some(b'\n') {
            self.pos += 1;
        }
    }

    /// Skip whitespace between rules, including blank lines.
    fn skip_blank(&mut self) {
        loop {
            match self.byte(self.pos) {
                Some(b' ' | b'\t' | b'\n' | b'\r') => self.pos += 1,
                Some(b'\\') if self.at_escaped_newline() => self.skip_escaped_newline(),
                _ => break,
            }
        }
    }

    /// Skip spaces within a rule; an escaped line break continues it.
    fn skip_inline(&mut self) {
        loop {
            match self.byte(self.pos) {
                Some(b' ' | b'\t') => self.pos += 1,
                Some(b'\\') if self.at_escaped_newline() => self.skip_escaped_newline(),
                _ => break,
            }
        }
    }

    /// Take one path token, or None at a line break or end of input.
    fn take_path(&mut self) -> Option<&'a [u8]> {
        self.skip_inline();
        let start = self.pos;
        loop {
            match self.byte(self.pos) {
                None | Some(b' ' | b'\t' | b'\n' | b'\r') => break,
                Some(b'\\') if self.at_escaped_newline() => break,
                Some(_) => self.pos += 1,
            }
        }
        let buf = self.buf;
        if self.pos > start {
            Some(&buf[start..self.pos])
        } else {
            None
        }
    }
}

/// Parse a deps buffer, reporting each rule through `actions`.  Returns
/// false if a parse error was reported.
pub fn parse(buf: &[u8], actions: &mut dyn ParseActions) -> bool {
    let mut cur = Cursor { buf, pos: 0 };
    loop {
        cur.skip_blank();
        let Some(token) = cur.take_path() else {
            // Clean end of input.
            return true;
        };
        let target = match token {
            [head @ .., b':'] if !head.is_empty() => head,
            _ => {
                cur.skip_inline();
                if cur.byte(cur.pos) != Some(b':') {
                    actions.error("expected ':' after rule target", cur.pos);
                    return false;
                }
                cur.pos += 1;
                token
            }
        };
        let Ok(target) = std::str::from_utf8(target) else {
            actions.error("rule target is not valid UTF-8", cur.pos);
            return false;
        };
        actions.rule_start(target);
        while let Some(dep) = cur.take_path() {
            let Ok(dep) = std::str::from_utf8(dep) else {
                actions.error("dependency path is not valid UTF-8", cur.pos);
                return false;
            };
            actions.rule_dependency(dep);
        }
        actions.rule_end();
    }
}
