//! Inscription envelope, redeem script and P2SH wrapper
//!
//! Scripts are assembled from a closed set of [`ScriptElement`]s. Single-byte
//! values 0..=16 always encode as their literal opcode (and 0x81 as
//! OP_1NEGATE); a generic push of those bytes fails MINIMALDATA on the network
//! even though the signature still verifies locally.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::error::AppError;

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_DROP: u8 = 0x75;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;

/// Largest single push the interpreter accepts
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Protocol marker opening every envelope
pub const INSCRIPTION_MARKER: &[u8] = b"ord";

/// Largest low-S DER signature plus the hash type byte
pub const MAX_SIGNATURE_SIZE: usize = 73;

/// Largest body accepted by configuration. With a short content type its
/// reveal scriptSig stays under the consensus script size.
pub const MAX_ENVELOPE_BODY_SIZE: usize = 9_500;

/// Tag literal introducing the content type
const CONTENT_TYPE_TAG: u8 = 1;

/// Separator literal between the content type and the body
const BODY_SEPARATOR: u8 = 0;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("script element of {0} bytes exceeds the 520 byte push limit")]
    ElementTooLarge(usize),
    #[error("literal {0} is not a small integer")]
    InvalidLiteral(u8),
    #[error("push at offset {0} runs past the end of the script")]
    TruncatedPush(usize),
    #[error("envelope marker not found")]
    MarkerNotFound,
    #[error("expected {expected} at offset {offset}")]
    UnexpectedElement { expected: &'static str, offset: usize },
    #[error("content type is not valid UTF-8")]
    InvalidContentType,
    #[error("invalid redeem script: {0}")]
    InvalidRedeemScript(String),
    #[error("envelope has {expected} elements but the scriptSig carries {found}")]
    ElementCountMismatch { expected: usize, found: usize },
}

impl From<ScriptError> for AppError {
    fn from(err: ScriptError) -> Self {
        match err {
            ScriptError::ElementTooLarge(_) | ScriptError::InvalidLiteral(_) => {
                AppError::ValidationError(err.to_string())
            }
            _ => AppError::MalformedEnvelope(err.to_string()),
        }
    }
}

/// Non-push operators used by the scripts built here
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Drop,
    Dup,
    Equal,
    EqualVerify,
    Hash160,
    CheckSig,
    CheckSigVerify,
}

impl Opcode {
    pub fn byte(self) -> u8 {
        match self {
            Opcode::Drop => OP_DROP,
            Opcode::Dup => OP_DUP,
            Opcode::Equal => OP_EQUAL,
            Opcode::EqualVerify => OP_EQUALVERIFY,
            Opcode::Hash160 => OP_HASH160,
            Opcode::CheckSig => OP_CHECKSIG,
            Opcode::CheckSigVerify => OP_CHECKSIGVERIFY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptElement {
    /// Data push; encoded minimally
    Push(Vec<u8>),
    /// Small integer 0..=16 as OP_0 / OP_1..OP_16
    Literal(u8),
    Op(Opcode),
}

impl ScriptElement {
    /// Data element normalized to its minimal representation
    pub fn data(bytes: &[u8]) -> Self {
        match bytes {
            [] => ScriptElement::Literal(0),
            [b] if *b <= 16 => ScriptElement::Literal(*b),
            _ => ScriptElement::Push(bytes.to_vec()),
        }
    }

    pub fn encode_into(&self, script: &mut Vec<u8>) -> Result<(), ScriptError> {
        match self {
            ScriptElement::Literal(n) => script.push(literal_opcode(*n)?),
            ScriptElement::Op(op) => script.push(op.byte()),
            ScriptElement::Push(bytes) => match bytes.as_slice() {
                [] => script.push(OP_0),
                [b] if *b <= 16 => script.push(literal_opcode(*b)?),
                [0x81] => script.push(OP_1NEGATE),
                _ => {
                    let len = bytes.len();
                    if len > MAX_SCRIPT_ELEMENT_SIZE {
                        return Err(ScriptError::ElementTooLarge(len));
                    }
                    if len <= 0x4b {
                        script.push(len as u8);
                    } else if len <= 0xff {
                        script.push(OP_PUSHDATA1);
                        script.push(len as u8);
                    } else {
                        script.push(OP_PUSHDATA2);
                        script.extend_from_slice(&(len as u16).to_le_bytes());
                    }
                    script.extend_from_slice(bytes);
                }
            },
        }
        Ok(())
    }
}

fn literal_opcode(n: u8) -> Result<u8, ScriptError> {
    match n {
        0 => Ok(OP_0),
        1..=16 => Ok(OP_1 + n - 1),
        _ => Err(ScriptError::InvalidLiteral(n)),
    }
}

/// Encode a sequence of elements into script bytes
pub fn build_script(elements: &[ScriptElement]) -> Result<Vec<u8>, ScriptError> {
    let mut script = Vec::new();
    for element in elements {
        element.encode_into(&mut script)?;
    }
    Ok(script)
}

/// RIPEMD160(SHA256(data))
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripemd = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripemd);
    out
}

/// Inscription content: marker, content type and body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    content_type: String,
    body: Vec<u8>,
}

impl Envelope {
    pub fn new(content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            body,
        }
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_chunks(&self) -> std::slice::Chunks<'_, u8> {
        self.body.chunks(MAX_SCRIPT_ELEMENT_SIZE)
    }

    /// Marker, tag, content type, separator and one per body chunk
    pub fn element_count(&self) -> usize {
        4 + self.body_chunks().len()
    }

    pub fn elements(&self) -> Vec<ScriptElement> {
        let mut elements = Vec::with_capacity(self.element_count());
        elements.push(ScriptElement::data(INSCRIPTION_MARKER));
        elements.push(ScriptElement::Literal(CONTENT_TYPE_TAG));
        elements.push(ScriptElement::data(self.content_type.as_bytes()));
        elements.push(ScriptElement::Literal(BODY_SEPARATOR));
        elements.extend(self.body_chunks().map(ScriptElement::data));
        elements
    }

    /// The envelope as the leading pushes of a scriptSig
    pub fn to_bytes(&self) -> Result<Vec<u8>, ScriptError> {
        build_script(&self.elements())
    }
}

/// `<pubkey> OP_CHECKSIGVERIFY OP_DROP × N OP_1` where N covers every
/// envelope element, leaving a single true value on the stack
pub fn build_redeem_script(public_key: &[u8], envelope: &Envelope) -> Result<Vec<u8>, ScriptError> {
    if public_key.len() != 33 && public_key.len() != 65 {
        return Err(ScriptError::InvalidRedeemScript(format!(
            "public key must be 33 or 65 bytes, got {}",
            public_key.len()
        )));
    }

    let mut elements = Vec::with_capacity(envelope.element_count() + 3);
    elements.push(ScriptElement::Push(public_key.to_vec()));
    elements.push(ScriptElement::Op(Opcode::CheckSigVerify));
    elements.extend(std::iter::repeat(ScriptElement::Op(Opcode::Drop)).take(envelope.element_count()));
    elements.push(ScriptElement::Literal(1));

    let script = build_script(&elements)?;
    // The redeem script itself is pushed in the reveal scriptSig
    if script.len() > MAX_SCRIPT_ELEMENT_SIZE {
        return Err(ScriptError::ElementTooLarge(script.len()));
    }
    Ok(script)
}

/// `OP_HASH160 <hash160(redeem)> OP_EQUAL`
pub fn p2sh_script_pubkey(redeem_script: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(&hash160(redeem_script));
    script.push(OP_EQUAL);
    script
}

/// `OP_DUP OP_HASH160 <pubkey hash> OP_EQUALVERIFY OP_CHECKSIG`
pub fn p2pkh_script_pubkey(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(0x14);
    script.extend_from_slice(pubkey_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// `<signature> <pubkey>`
pub fn p2pkh_script_sig(signature: &[u8], public_key: &[u8]) -> Result<Vec<u8>, ScriptError> {
    build_script(&[
        ScriptElement::Push(signature.to_vec()),
        ScriptElement::Push(public_key.to_vec()),
    ])
}

/// `<envelope…> <signature> <redeem script>`
pub fn reveal_script_sig(
    envelope: &Envelope,
    signature: &[u8],
    redeem_script: &[u8],
) -> Result<Vec<u8>, ScriptError> {
    let mut script = envelope.to_bytes()?;
    ScriptElement::Push(signature.to_vec()).encode_into(&mut script)?;
    ScriptElement::Push(redeem_script.to_vec()).encode_into(&mut script)?;
    Ok(script)
}

/// Size of the reveal scriptSig with the longest possible signature
pub fn max_reveal_script_sig_len(
    envelope: &Envelope,
    redeem_script: &[u8],
) -> Result<usize, ScriptError> {
    Ok(reveal_script_sig(envelope, &[0u8; MAX_SIGNATURE_SIZE], redeem_script)?.len())
}

/// One decoded script instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction<'a> {
    Push(&'a [u8]),
    /// OP_0..OP_16 as 0..=16, OP_1NEGATE as 0x81
    Literal(u8),
    Op(u8),
}

impl Instruction<'_> {
    /// Stack content the instruction pushes, if it is a push at all.
    /// Literals map to their single byte so that minimally encoded body
    /// chunks reassemble to the original bytes.
    pub fn data(&self) -> Option<Vec<u8>> {
        match self {
            Instruction::Push(bytes) => Some(bytes.to_vec()),
            Instruction::Literal(n) => Some(vec![*n]),
            Instruction::Op(_) => None,
        }
    }

    fn is_small_int(&self, n: u8) -> bool {
        match self {
            Instruction::Literal(v) => *v == n,
            Instruction::Push(bytes) => *bytes == [n],
            Instruction::Op(_) => false,
        }
    }

    fn is_separator(&self) -> bool {
        match self {
            Instruction::Literal(v) => *v == BODY_SEPARATOR,
            Instruction::Push(bytes) => bytes.is_empty(),
            Instruction::Op(_) => false,
        }
    }
}

/// Iterator over the instructions of a script, with byte offsets
pub struct Instructions<'a> {
    script: &'a [u8],
    pos: usize,
}

impl<'a> Instructions<'a> {
    pub fn new(script: &'a [u8]) -> Self {
        Self { script, pos: 0 }
    }

    fn take(&mut self, start: usize, len: usize) -> Result<&'a [u8], ScriptError> {
        let end = self.pos.checked_add(len).ok_or(ScriptError::TruncatedPush(start))?;
        if end > self.script.len() {
            return Err(ScriptError::TruncatedPush(start));
        }
        let slice = &self.script[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<(usize, Instruction<'a>), ScriptError>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.pos;
        let opcode = *self.script.get(start)?;
        self.pos += 1;

        let result = match opcode {
            OP_0 => Ok(Instruction::Literal(0)),
            0x01..=0x4b => self.take(start, opcode as usize).map(Instruction::Push),
            OP_PUSHDATA1 => self
                .take(start, 1)
                .and_then(|len| self.take(start, len[0] as usize))
                .map(Instruction::Push),
            OP_PUSHDATA2 => self
                .take(start, 2)
                .and_then(|len| self.take(start, u16::from_le_bytes([len[0], len[1]]) as usize))
                .map(Instruction::Push),
            OP_PUSHDATA4 => self
                .take(start, 4)
                .and_then(|len| {
                    let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]);
                    self.take(start, len as usize)
                })
                .map(Instruction::Push),
            OP_1NEGATE => Ok(Instruction::Literal(0x81)),
            OP_1..=OP_16 => Ok(Instruction::Literal(opcode - OP_1 + 1)),
            other => Ok(Instruction::Op(other)),
        };

        if result.is_err() {
            // Stop iterating after a malformed push
            self.pos = self.script.len();
        }
        Some(result.map(|instruction| (start, instruction)))
    }
}

/// Content type and body recovered from a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEnvelope {
    pub content_type: String,
    pub body: Vec<u8>,
}

fn expect_next<'a, I>(iter: &mut I, expected: &'static str, end: usize) -> Result<(usize, Instruction<'a>), ScriptError>
where
    I: Iterator<Item = Result<(usize, Instruction<'a>), ScriptError>>,
{
    match iter.next() {
        Some(item) => item,
        None => Err(ScriptError::UnexpectedElement { expected, offset: end }),
    }
}

fn parse_from_instructions<'a, I>(mut iter: I, end: usize) -> Result<ParsedEnvelope, ScriptError>
where
    I: Iterator<Item = Result<(usize, Instruction<'a>), ScriptError>>,
{
    // Scan for the marker
    loop {
        match iter.next() {
            Some(item) => {
                if let (_, Instruction::Push(bytes)) = item? {
                    if bytes == INSCRIPTION_MARKER {
                        break;
                    }
                }
            }
            None => return Err(ScriptError::MarkerNotFound),
        }
    }

    let (offset, tag) = expect_next(&mut iter, "content type tag", end)?;
    if !tag.is_small_int(CONTENT_TYPE_TAG) {
        return Err(ScriptError::UnexpectedElement { expected: "content type tag", offset });
    }

    let (offset, content_type) = expect_next(&mut iter, "content type", end)?;
    let content_type = content_type
        .data()
        .ok_or(ScriptError::UnexpectedElement { expected: "content type", offset })?;
    let content_type = String::from_utf8(content_type).map_err(|_| ScriptError::InvalidContentType)?;

    let (offset, separator) = expect_next(&mut iter, "body separator", end)?;
    if !separator.is_separator() {
        return Err(ScriptError::UnexpectedElement { expected: "body separator", offset });
    }

    let mut body = Vec::new();
    for item in iter {
        let (_, instruction) = item?;
        match instruction.data() {
            Some(chunk) => body.extend_from_slice(&chunk),
            None => break,
        }
    }

    Ok(ParsedEnvelope { content_type, body })
}

/// Recover the envelope from any script, stopping the body at the first
/// non-push opcode or the end of the script
pub fn parse_envelope(script: &[u8]) -> Result<ParsedEnvelope, ScriptError> {
    parse_from_instructions(Instructions::new(script), script.len())
}

/// A reveal scriptSig split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealParts {
    pub envelope: ParsedEnvelope,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
    pub redeem_script: Vec<u8>,
}

/// Decode a redeem script, returning the public key and drop count
pub fn parse_redeem_script(script: &[u8]) -> Result<(Vec<u8>, usize), ScriptError> {
    let invalid = |msg: &str| ScriptError::InvalidRedeemScript(msg.to_string());
    let instructions = Instructions::new(script)
        .map(|item| item.map(|(_, instruction)| instruction))
        .collect::<Result<Vec<_>, _>>()?;

    let (public_key, rest) = match instructions.split_first() {
        Some((Instruction::Push(key), rest)) if key.len() == 33 || key.len() == 65 => (key.to_vec(), rest),
        _ => return Err(invalid("missing public key push")),
    };
    let rest = match rest.split_first() {
        Some((Instruction::Op(OP_CHECKSIGVERIFY), rest)) => rest,
        _ => return Err(invalid("missing OP_CHECKSIGVERIFY")),
    };
    let drops = match rest.split_last() {
        Some((Instruction::Literal(1), drops)) => drops,
        _ => return Err(invalid("missing trailing OP_1")),
    };
    if drops.iter().any(|i| *i != Instruction::Op(OP_DROP)) {
        return Err(invalid("unexpected opcode between OP_CHECKSIGVERIFY and OP_1"));
    }
    Ok((public_key, drops.len()))
}

/// Parse a reveal scriptSig using the redeem script's drop count to find
/// exactly where the envelope ends and the signature begins
pub fn parse_reveal_script_sig(script_sig: &[u8]) -> Result<RevealParts, ScriptError> {
    let instructions = Instructions::new(script_sig).collect::<Result<Vec<_>, _>>()?;
    if instructions.len() < 2 {
        return Err(ScriptError::UnexpectedElement {
            expected: "signature and redeem script",
            offset: script_sig.len(),
        });
    }

    let split = instructions.len() - 2;
    let redeem_script = match &instructions[split + 1].1 {
        Instruction::Push(bytes) => bytes.to_vec(),
        _ => return Err(ScriptError::InvalidRedeemScript("not a push".to_string())),
    };
    let signature = instructions[split]
        .1
        .data()
        .ok_or(ScriptError::UnexpectedElement { expected: "signature", offset: instructions[split].0 })?;
    let (public_key, drop_count) = parse_redeem_script(&redeem_script)?;
    if drop_count != split {
        return Err(ScriptError::ElementCountMismatch { expected: drop_count, found: split });
    }

    let end = instructions[split].0;
    let envelope = parse_from_instructions(instructions[..split].iter().cloned().map(Ok), end)?;

    Ok(RevealParts {
        envelope,
        signature,
        public_key,
        redeem_script,
    })
}
