use super::base_stream::BaseStream;
use super::error::{PDFError, PDFResult};

/// Maximum length of a command token.
const MAX_COMMAND_LENGTH: usize = 128;

/// PDF token types returned by the Lexer.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// End of file marker
    EOF,

    /// Boolean value
    Boolean(bool),

    /// Null value
    Null,

    /// Numeric value (integers and reals)
    Number(f64),

    /// String value (from literal strings like (hello))
    String(Vec<u8>),

    /// Hex string value (from hex strings like <48656c6c6f>)
    HexString(Vec<u8>),

    /// Name value (from /Name)
    Name(String),

    /// Command/operator (like 'q', 'Q', 'BT', 'ET', etc.)
    Command(String),

    /// Array start '['
    ArrayStart,

    /// Array end ']'
    ArrayEnd,

    /// Dictionary start '<<'
    DictStart,

    /// Dictionary end '>>'
    DictEnd,

    /// PostScript procedure start '{'
    BraceStart,

    /// PostScript procedure end '}'
    BraceEnd,
}

/// Predicate telling the lexer whether a string is a known operator.
pub type KnownCommands = fn(&str) -> bool;

/// PDF Lexer for tokenizing PDF syntax.
///
/// Analogous to PDF.js's Lexer class which tokenizes the PDF byte stream
/// into numbers, strings, names, operators and structural delimiters.
///
/// The lexer is tolerant: malformed bytes produce a best-effort token and a
/// warning rather than an error. Only errors from the underlying stream
/// (most importantly `MissingData`) are propagated.
///
/// When built with a known-commands predicate, operators written without
/// separating whitespace are split apart: `qqQQ` lexes as four commands.
pub struct Lexer {
    /// The input stream
    stream: Box<dyn BaseStream>,

    /// Current character being examined, -1 at EOF
    current_char: i32,

    /// Buffer for building strings
    str_buf: Vec<u8>,

    known_commands: Option<KnownCommands>,
}

impl Lexer {
    /// Creates a new Lexer from a stream.
    pub fn new(stream: Box<dyn BaseStream>) -> PDFResult<Self> {
        Self::create(stream, None)
    }

    /// Creates a Lexer that splits glued operators using `known_commands`.
    pub fn with_known_commands(
        stream: Box<dyn BaseStream>,
        known_commands: KnownCommands,
    ) -> PDFResult<Self> {
        Self::create(stream, Some(known_commands))
    }

    fn create(mut stream: Box<dyn BaseStream>, known_commands: Option<KnownCommands>) -> PDFResult<Self> {
        let current_char = Self::read_char(stream.as_mut())?;
        Ok(Lexer {
            stream,
            current_char,
            str_buf: Vec::new(),
            known_commands,
        })
    }

    /// Reads the next character from the stream. Returns -1 on EOF.
    fn read_char(stream: &mut dyn BaseStream) -> PDFResult<i32> {
        match stream.get_byte() {
            Ok(byte) => Ok(byte as i32),
            Err(PDFError::UnexpectedEndOfStream) => Ok(-1),
            Err(e) => Err(e),
        }
    }

    /// Advances to the next character.
    fn next_char(&mut self) -> PDFResult<i32> {
        self.current_char = Self::read_char(self.stream.as_mut())?;
        Ok(self.current_char)
    }

    /// Peeks at the next character without consuming it.
    fn peek_char(&mut self) -> PDFResult<i32> {
        match self.stream.peek_byte() {
            Ok(byte) => Ok(byte as i32),
            Err(PDFError::UnexpectedEndOfStream) => Ok(-1),
            Err(e) => Err(e),
        }
    }

    /// PDF whitespace: NUL, TAB, LF, FF, CR, SPACE
    pub(crate) fn is_whitespace(ch: i32) -> bool {
        matches!(ch, 0x00 | 0x09 | 0x0A | 0x0C | 0x0D | 0x20)
    }

    /// PDF delimiters: ( ) < > [ ] { } / %
    fn is_delimiter(ch: i32) -> bool {
        matches!(
            ch,
            0x28 | 0x29 | 0x3C | 0x3E | 0x5B | 0x5D | 0x7B | 0x7D | 0x2F | 0x25
        )
    }

    /// Whitespace or delimiter.
    fn is_special(ch: i32) -> bool {
        Self::is_whitespace(ch) || Self::is_delimiter(ch)
    }

    /// Position of the current (already read) character.
    pub fn get_position(&self) -> usize {
        if self.current_char < 0 {
            self.stream.pos()
        } else {
            self.stream.pos() - 1
        }
    }

    /// Position of the byte after the current character.
    pub fn stream_pos(&self) -> usize {
        self.stream.pos()
    }

    /// Repositions the lexer so that `pos` is the next character examined.
    pub fn set_position(&mut self, pos: usize) -> PDFResult<()> {
        self.stream.set_pos(pos)?;
        self.next_char()?;
        Ok(())
    }

    /// Offset one past the last readable byte.
    pub fn stream_end(&self) -> usize {
        self.stream.end()
    }

    /// Returns raw bytes without moving the lexer.
    pub fn get_byte_range(&self, begin: usize, end: usize) -> PDFResult<Vec<u8>> {
        self.stream.get_byte_range(begin, end.min(self.stream.end()))
    }

    /// Consumes the rest of the current line, including its EOL marker.
    pub fn skip_to_next_line(&mut self) -> PDFResult<()> {
        let mut ch = self.current_char;
        while ch >= 0 {
            if ch == 0x0D {
                ch = self.next_char()?;
                if ch == 0x0A {
                    self.next_char()?;
                }
                break;
            } else if ch == 0x0A {
                self.next_char()?;
                break;
            }
            ch = self.next_char()?;
        }
        Ok(())
    }

    /// Skips whitespace and comments.
    fn skip_whitespace_and_comments(&mut self) -> PDFResult<()> {
        let mut comment = false;

        loop {
            let ch = self.current_char;
            if ch < 0 {
                break;
            }

            if comment {
                if ch == 0x0A || ch == 0x0D {
                    comment = false;
                }
            } else if ch == 0x25 {
                comment = true;
            } else if !Self::is_whitespace(ch) {
                break;
            }

            self.next_char()?;
        }

        Ok(())
    }

    /// Gets the next token from the stream.
    ///
    /// Analogous to PDF.js's Lexer.getObj()
    pub fn get_object(&mut self) -> PDFResult<Token> {
        self.skip_whitespace_and_comments()?;

        let ch = self.current_char;
        if ch < 0 {
            return Ok(Token::EOF);
        }

        match ch {
            // Numbers: 0-9, +, -, .
            0x30..=0x39 | 0x2B | 0x2D | 0x2E => self.get_number(),

            0x28 => self.get_string(),

            0x2F => self.get_name(),

            0x5B => {
                self.next_char()?;
                Ok(Token::ArrayStart)
            }
            0x5D => {
                self.next_char()?;
                Ok(Token::ArrayEnd)
            }
            0x7B => {
                self.next_char()?;
                Ok(Token::BraceStart)
            }
            0x7D => {
                self.next_char()?;
                Ok(Token::BraceEnd)
            }

            0x3C => {
                let next_ch = self.next_char()?;
                if next_ch == 0x3C {
                    self.next_char()?;
                    Ok(Token::DictStart)
                } else {
                    self.get_hex_string()
                }
            }

            0x3E => {
                let next_ch = self.next_char()?;
                if next_ch == 0x3E {
                    self.next_char()?;
                    Ok(Token::DictEnd)
                } else {
                    log::warn!("Lone '>' at offset {}", self.get_position());
                    Ok(Token::Command(">".to_string()))
                }
            }

            0x29 => {
                log::warn!("Illegal character ')' at offset {}", self.get_position());
                self.next_char()?;
                Ok(Token::Command(")".to_string()))
            }

            _ => self.get_command(),
        }
    }

    /// Parses a number token.
    ///
    /// Follows Adobe Reader's tolerance: a doubled leading minus is ignored,
    /// minus signs inside the number are skipped, line breaks after the sign
    /// are skipped, and a sign with no digits before whitespace or EOF is 0.
    fn get_number(&mut self) -> PDFResult<Token> {
        let mut ch = self.current_char;
        let mut e_notation = false;
        let mut divide_by = 0.0; // Non-zero if it's a floating point value
        let mut sign = 1.0;

        if ch == 0x2D {
            sign = -1.0;
            ch = self.next_char()?;
            if ch == 0x2D {
                ch = self.next_char()?;
            }
        } else if ch == 0x2B {
            ch = self.next_char()?;
        }

        if ch == 0x0A || ch == 0x0D {
            loop {
                ch = self.next_char()?;
                if ch != 0x0A && ch != 0x0D {
                    break;
                }
            }
        }

        if ch == 0x2E {
            divide_by = 10.0;
            ch = self.next_char()?;
        }

        if !(0x30..=0x39).contains(&ch) {
            if Self::is_whitespace(ch) || ch == 0x28 || ch == 0x3C || ch < 0 {
                log::debug!("Invalid number at offset {}, using 0", self.get_position());
            } else {
                log::warn!(
                    "Invalid number: {} (charCode {}), using 0",
                    ch as u8 as char,
                    ch
                );
            }
            return Ok(Token::Number(0.0));
        }

        let mut base_value = (ch - 0x30) as f64;
        let mut power_value: i32 = 0;
        let mut power_value_sign = 1;

        loop {
            ch = self.next_char()?;
            if ch < 0 {
                break;
            }

            if (0x30..=0x39).contains(&ch) {
                let current_digit = ch - 0x30;
                if e_notation {
                    power_value = power_value.saturating_mul(10).saturating_add(current_digit);
                } else {
                    if divide_by != 0.0 {
                        divide_by *= 10.0;
                    }
                    base_value = base_value * 10.0 + current_digit as f64;
                }
            } else if ch == 0x2E {
                if divide_by == 0.0 {
                    divide_by = 1.0;
                } else {
                    // A number can have only one dot
                    break;
                }
            } else if ch == 0x2D {
                log::debug!("Ignoring minus sign in the middle of a number");
            } else if ch == 0x45 || ch == 0x65 {
                // 'E' is either an exponent or the start of the next operator
                let peek_ch = self.peek_char()?;
                if peek_ch == 0x2B || peek_ch == 0x2D {
                    power_value_sign = if peek_ch == 0x2D { -1 } else { 1 };
                    self.next_char()?;
                } else if !(0x30..=0x39).contains(&peek_ch) {
                    break;
                }
                e_notation = true;
            } else {
                break;
            }
        }

        let mut result = base_value;
        if divide_by != 0.0 {
            result /= divide_by;
        }
        if e_notation {
            result *= 10_f64.powi(power_value_sign * power_value);
        }

        Ok(Token::Number(sign * result))
    }

    /// Parses a literal string token, handling nesting and escapes.
    fn get_string(&mut self) -> PDFResult<Token> {
        let mut num_paren = 1;
        self.str_buf.clear();

        let mut ch = self.next_char()?;

        loop {
            let mut char_buffered = false;

            match ch {
                -1 => {
                    log::warn!("Unterminated string");
                    break;
                }

                0x28 => {
                    num_paren += 1;
                    self.str_buf.push(b'(');
                }

                0x29 => {
                    num_paren -= 1;
                    if num_paren == 0 {
                        self.next_char()?;
                        break;
                    }
                    self.str_buf.push(b')');
                }

                0x5C => {
                    ch = self.next_char()?;
                    match ch {
                        -1 => {
                            log::warn!("Unterminated string");
                            break;
                        }
                        0x6E => self.str_buf.push(b'\n'),
                        0x72 => self.str_buf.push(b'\r'),
                        0x74 => self.str_buf.push(b'\t'),
                        0x62 => self.str_buf.push(0x08),
                        0x66 => self.str_buf.push(0x0C),
                        0x5C | 0x28 | 0x29 => self.str_buf.push(ch as u8),
                        0x30..=0x37 => {
                            // Octal escape, 1 to 3 digits
                            let mut x = (ch & 0x0F) as u32;
                            ch = self.next_char()?;
                            char_buffered = true;

                            if (0x30..=0x37).contains(&ch) {
                                x = (x << 3) + (ch & 0x0F) as u32;
                                ch = self.next_char()?;

                                if (0x30..=0x37).contains(&ch) {
                                    char_buffered = false;
                                    x = (x << 3) + (ch & 0x0F) as u32;
                                }
                            }
                            self.str_buf.push((x & 0xFF) as u8);
                        }
                        0x0D => {
                            // Line continuation
                            if self.peek_char()? == 0x0A {
                                self.next_char()?;
                            }
                        }
                        0x0A => {}
                        _ => self.str_buf.push(ch as u8),
                    }
                }

                _ => self.str_buf.push(ch as u8),
            }

            if !char_buffered {
                ch = self.next_char()?;
            }
        }

        Ok(Token::String(self.str_buf.clone()))
    }

    /// Converts a hex character to its value, or -1.
    fn to_hex_digit(ch: i32) -> i32 {
        match ch {
            0x30..=0x39 => ch & 0x0F,
            0x41..=0x46 | 0x61..=0x66 => (ch & 0x0F) + 9,
            _ => -1,
        }
    }

    /// Parses a hex string token like <48656c6c6f>.
    fn get_hex_string(&mut self) -> PDFResult<Token> {
        self.str_buf.clear();
        let mut ch = self.current_char;
        let mut first_digit = -1;

        loop {
            if ch < 0 {
                log::warn!("Unterminated hex string");
                break;
            } else if ch == 0x3E {
                self.next_char()?;
                break;
            } else if Self::is_whitespace(ch) {
                ch = self.next_char()?;
                continue;
            }

            let digit = Self::to_hex_digit(ch);
            if digit == -1 {
                log::warn!("Ignoring invalid character \"{}\" in hex string", ch);
            } else if first_digit == -1 {
                first_digit = digit;
            } else {
                self.str_buf.push(((first_digit << 4) | digit) as u8);
                first_digit = -1;
            }
            ch = self.next_char()?;
        }

        // Odd number of digits: the final digit is padded with 0
        if first_digit != -1 {
            self.str_buf.push((first_digit << 4) as u8);
        }

        Ok(Token::HexString(self.str_buf.clone()))
    }

    /// Parses a name token, decoding `#xx` escapes.
    fn get_name(&mut self) -> PDFResult<Token> {
        self.str_buf.clear();

        let mut ch = self.next_char()?;

        while ch >= 0 && !Self::is_special(ch) {
            if ch == 0x23 {
                ch = self.next_char()?;

                if ch < 0 || Self::is_special(ch) {
                    log::warn!("Lexer_getName: NUMBER SIGN (#) should be followed by a hexadecimal number.");
                    self.str_buf.push(b'#');
                    break;
                }

                let x = Self::to_hex_digit(ch);
                if x != -1 {
                    let previous_ch = ch;
                    ch = self.next_char()?;
                    let x2 = Self::to_hex_digit(ch);

                    if x2 == -1 {
                        log::warn!("Lexer_getName: Illegal digit ({}) in hexadecimal number.", ch);
                        self.str_buf.push(b'#');
                        self.str_buf.push(previous_ch as u8);

                        if ch < 0 || Self::is_special(ch) {
                            break;
                        }
                        self.str_buf.push(ch as u8);
                        ch = self.next_char()?;
                        continue;
                    }

                    self.str_buf.push(((x << 4) | x2) as u8);
                } else {
                    self.str_buf.push(b'#');
                    self.str_buf.push(ch as u8);
                }
            } else {
                self.str_buf.push(ch as u8);
            }

            ch = self.next_char()?;
        }

        Ok(Token::Name(String::from_utf8_lossy(&self.str_buf).into_owned()))
    }

    /// Parses a command/keyword token.
    ///
    /// With a known-commands predicate, the command ends as soon as the text
    /// read so far is a known command and appending the next byte would not
    /// be one.
    fn get_command(&mut self) -> PDFResult<Token> {
        let mut command = String::new();
        command.push(self.current_char as u8 as char);

        let mut known_command_found = self.is_known(&command);
        loop {
            let ch = self.next_char()?;
            if ch < 0 || Self::is_special(ch) {
                break;
            }

            let mut possible_command = command.clone();
            possible_command.push(ch as u8 as char);
            if known_command_found && !self.is_known(&possible_command) {
                break;
            }
            if command.len() >= MAX_COMMAND_LENGTH {
                log::warn!("Command token too long: {}", command.len());
                // Drop the rest of the runaway token
                while self.current_char >= 0 && !Self::is_special(self.current_char) {
                    self.next_char()?;
                }
                break;
            }
            command = possible_command;
            known_command_found = self.is_known(&command);
        }

        Ok(match command.as_str() {
            "true" => Token::Boolean(true),
            "false" => Token::Boolean(false),
            "null" => Token::Null,
            _ => Token::Command(command),
        })
    }

    fn is_known(&self, command: &str) -> bool {
        self.known_commands.is_some_and(|known| known(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Stream;

    fn lexer_for(data: &[u8]) -> Lexer {
        let stream = Box::new(Stream::from_bytes(data.to_vec())) as Box<dyn BaseStream>;
        Lexer::new(stream).unwrap()
    }

    fn content_ops(command: &str) -> bool {
        matches!(command, "q" | "Q" | "f" | "Ts" | "Tf" | "BD" | "BDC" | "B" | "fa" | "fal" | "fals" | "false")
    }

    #[test]
    fn test_eof() {
        let mut lexer = lexer_for(b"");
        assert_eq!(lexer.get_object().unwrap(), Token::EOF);
    }

    #[test]
    fn test_structural_tokens() {
        let mut lexer = lexer_for(b"[ << >> ] { }");
        assert_eq!(lexer.get_object().unwrap(), Token::ArrayStart);
        assert_eq!(lexer.get_object().unwrap(), Token::DictStart);
        assert_eq!(lexer.get_object().unwrap(), Token::DictEnd);
        assert_eq!(lexer.get_object().unwrap(), Token::ArrayEnd);
        assert_eq!(lexer.get_object().unwrap(), Token::BraceStart);
        assert_eq!(lexer.get_object().unwrap(), Token::BraceEnd);
        assert_eq!(lexer.get_object().unwrap(), Token::EOF);
    }

    #[test]
    fn test_skip_comments() {
        let mut lexer = lexer_for(b"% comment\n[");
        assert_eq!(lexer.get_object().unwrap(), Token::ArrayStart);
    }

    #[test]
    fn test_numbers() {
        let mut lexer = lexer_for(b"1 2.5 -3 +4 .5 1.5e3 2E-2");
        assert_eq!(lexer.get_object().unwrap(), Token::Number(1.0));
        assert_eq!(lexer.get_object().unwrap(), Token::Number(2.5));
        assert_eq!(lexer.get_object().unwrap(), Token::Number(-3.0));
        assert_eq!(lexer.get_object().unwrap(), Token::Number(4.0));
        assert_eq!(lexer.get_object().unwrap(), Token::Number(0.5));
        assert_eq!(lexer.get_object().unwrap(), Token::Number(1500.0));
        assert_eq!(lexer.get_object().unwrap(), Token::Number(0.02));
    }

    #[test]
    fn test_double_negative() {
        let mut lexer = lexer_for(b"--5");
        assert_eq!(lexer.get_object().unwrap(), Token::Number(-5.0));
    }

    #[test]
    fn test_minus_in_middle_is_ignored() {
        let mut lexer = lexer_for(b"12-3");
        assert_eq!(lexer.get_object().unwrap(), Token::Number(123.0));
    }

    #[test]
    fn test_line_break_after_sign() {
        let mut lexer = lexer_for(b"-\r\n7");
        assert_eq!(lexer.get_object().unwrap(), Token::Number(-7.0));
    }

    #[test]
    fn test_invalid_number_returns_zero() {
        let mut lexer = lexer_for(b"- ");
        assert_eq!(lexer.get_object().unwrap(), Token::Number(0.0));
        let mut lexer = lexer_for(b"-");
        assert_eq!(lexer.get_object().unwrap(), Token::Number(0.0));
    }

    #[test]
    fn test_exponent_followed_by_operator() {
        let mut lexer = lexer_for(b"3ET");
        assert_eq!(lexer.get_object().unwrap(), Token::Number(3.0));
        assert_eq!(lexer.get_object().unwrap(), Token::Command("ET".to_string()));
    }

    #[test]
    fn test_strings() {
        let mut lexer = lexer_for(b"(a(b)c) (x\\n\\)\\\\) (\\101\\7) (line\\\r\ncont)");
        assert_eq!(lexer.get_object().unwrap(), Token::String(b"a(b)c".to_vec()));
        assert_eq!(lexer.get_object().unwrap(), Token::String(b"x\n)\\".to_vec()));
        assert_eq!(lexer.get_object().unwrap(), Token::String(vec![b'A', 7]));
        assert_eq!(lexer.get_object().unwrap(), Token::String(b"linecont".to_vec()));
    }

    #[test]
    fn test_octal_escape_overflow_wraps() {
        let mut lexer = lexer_for(b"(\\777)");
        assert_eq!(lexer.get_object().unwrap(), Token::String(vec![0xFF]));
    }

    #[test]
    fn test_unterminated_string_ends_at_eof() {
        let mut lexer = lexer_for(b"(abc");
        assert_eq!(lexer.get_object().unwrap(), Token::String(b"abc".to_vec()));
        assert_eq!(lexer.get_object().unwrap(), Token::EOF);
    }

    #[test]
    fn test_hex_strings() {
        let mut lexer = lexer_for(b"<48 65 6C6c6f> <ABC> <4x1>");
        assert_eq!(lexer.get_object().unwrap(), Token::HexString(b"Hello".to_vec()));
        assert_eq!(lexer.get_object().unwrap(), Token::HexString(vec![0xAB, 0xC0]));
        assert_eq!(lexer.get_object().unwrap(), Token::HexString(vec![0x41]));
    }

    #[test]
    fn test_names() {
        let mut lexer = lexer_for(b"/Type /A#20B /Bad#zz /Tr#");
        assert_eq!(lexer.get_object().unwrap(), Token::Name("Type".to_string()));
        assert_eq!(lexer.get_object().unwrap(), Token::Name("A B".to_string()));
        assert_eq!(lexer.get_object().unwrap(), Token::Name("Bad#zz".to_string()));
        assert_eq!(lexer.get_object().unwrap(), Token::Name("Tr#".to_string()));
    }

    #[test]
    fn test_keywords() {
        let mut lexer = lexer_for(b"true false null obj");
        assert_eq!(lexer.get_object().unwrap(), Token::Boolean(true));
        assert_eq!(lexer.get_object().unwrap(), Token::Boolean(false));
        assert_eq!(lexer.get_object().unwrap(), Token::Null);
        assert_eq!(lexer.get_object().unwrap(), Token::Command("obj".to_string()));
    }

    #[test]
    fn test_stray_delimiters_do_not_fail() {
        let mut lexer = lexer_for(b") > q");
        assert_eq!(lexer.get_object().unwrap(), Token::Command(")".to_string()));
        assert_eq!(lexer.get_object().unwrap(), Token::Command(">".to_string()));
        assert_eq!(lexer.get_object().unwrap(), Token::Command("q".to_string()));
    }

    #[test]
    fn test_glued_commands_are_split() {
        let stream = Box::new(Stream::from_bytes(b"qqQQ f5 Ts BDC false".to_vec())) as Box<dyn BaseStream>;
        let mut lexer = Lexer::with_known_commands(stream, content_ops).unwrap();

        for expected in ["q", "q", "Q", "Q", "f"] {
            assert_eq!(lexer.get_object().unwrap(), Token::Command(expected.to_string()));
        }
        assert_eq!(lexer.get_object().unwrap(), Token::Number(5.0));
        assert_eq!(lexer.get_object().unwrap(), Token::Command("Ts".to_string()));
        assert_eq!(lexer.get_object().unwrap(), Token::Command("BDC".to_string()));
        assert_eq!(lexer.get_object().unwrap(), Token::Boolean(false));
    }

    #[test]
    fn test_without_known_commands_tokens_are_greedy() {
        let mut lexer = lexer_for(b"qqQQ");
        assert_eq!(lexer.get_object().unwrap(), Token::Command("qqQQ".to_string()));
    }

    #[test]
    fn test_positions_and_skip_to_next_line() {
        let mut lexer = lexer_for(b"stream\r\nDATA");
        assert_eq!(lexer.get_object().unwrap(), Token::Command("stream".to_string()));
        lexer.skip_to_next_line().unwrap();
        assert_eq!(lexer.get_position(), 8);
        lexer.set_position(9).unwrap();
        assert_eq!(lexer.get_object().unwrap(), Token::Command("ATA".to_string()));
    }
}
