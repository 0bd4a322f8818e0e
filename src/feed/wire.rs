use crate::error::AppError;
use serde::de::IgnoredAny;
use serde::Deserialize;

const BLOCK_NUMBER_KEYS: [&str; 3] = ["block_number", "blockNumber", "number"];
const TIMESTAMP_KEY: &str = "timestamp";

/// Numeric field as it shows up on the wire: hex string, JSON number, or junk.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum QuantityWire {
    Number(u64),
    Text(String),
    Other(IgnoredAny),
}

impl QuantityWire {
    pub fn to_u64(&self) -> Option<u64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(text) => parse_hex_quantity(text),
            Self::Other(_) => None,
        }
    }

    fn to_label(&self) -> Option<String> {
        match self {
            Self::Number(value) => Some(value.to_string()),
            Self::Text(text) => Some(text.clone()),
            Self::Other(_) => None,
        }
    }
}

/// String field that falls back to absent when the upstream sends another type.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TextWire {
    Text(String),
    Other(IgnoredAny),
}

impl TextWire {
    fn into_text(self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text),
            Self::Other(_) => None,
        }
    }
}

/// List field where only the length matters.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ListWire {
    Items(Vec<IgnoredAny>),
    Other(IgnoredAny),
}

impl ListWire {
    fn len(&self) -> Option<u64> {
        match self {
            Self::Items(items) => Some(items.len() as u64),
            Self::Other(_) => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct BlockHeaderWire {
    pub number: Option<QuantityWire>,
    pub hash: Option<TextWire>,
    pub timestamp: Option<QuantityWire>,
    #[serde(rename = "gasUsed")]
    pub gas_used: Option<QuantityWire>,
    #[serde(rename = "baseFeePerGas")]
    pub base_fee_per_gas: Option<QuantityWire>,
    pub transactions: Option<ListWire>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RpcResultWire {
    Header(BlockHeaderWire),
    Scalar(QuantityWire),
}

#[derive(Debug, Deserialize)]
pub struct NotificationParamsWire {
    pub subscription: Option<QuantityWire>,
    pub result: Option<RpcResultWire>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ErrorCodeWire {
    Number(i64),
    Text(String),
    Other(IgnoredAny),
}

impl ErrorCodeWire {
    fn to_label(&self) -> Option<String> {
        match self {
            Self::Number(code) => Some(code.to_string()),
            Self::Text(text) => Some(text.clone()),
            Self::Other(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RpcErrorWire {
    pub code: Option<ErrorCodeWire>,
    pub message: Option<TextWire>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DiffMetadataWire {
    pub block_number: Option<QuantityWire>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DiffBodyWire {
    pub block_hash: Option<TextWire>,
    pub gas_used: Option<QuantityWire>,
    pub transactions: Option<ListWire>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DiffBaseWire {
    pub block_number: Option<QuantityWire>,
    pub timestamp: Option<QuantityWire>,
    pub base_fee_per_gas: Option<QuantityWire>,
}

/// Union of every top-level key either feed is known to send.
#[derive(Debug, Default, Deserialize)]
pub struct FeedEnvelopeWire {
    pub result: Option<RpcResultWire>,
    pub params: Option<NotificationParamsWire>,
    pub error: Option<RpcErrorWire>,
    pub metadata: Option<DiffMetadataWire>,
    pub diff: Option<DiffBodyWire>,
    pub base: Option<DiffBaseWire>,
    pub index: Option<QuantityWire>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    BlockDiff,
    Notification,
    DirectResponse,
    TextScan,
}

/// Block fields pulled out of a payload, before defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFields {
    pub shape: PayloadShape,
    pub number: u64,
    pub hash: Option<String>,
    pub timestamp: Option<u64>,
    pub transaction_count: Option<u64>,
    pub gas_used: Option<u64>,
    pub base_fee_per_gas: Option<u64>,
    pub child_index: Option<u32>,
}

impl BlockFields {
    fn bare(shape: PayloadShape, number: u64) -> Self {
        Self {
            shape,
            number,
            hash: None,
            timestamp: None,
            transaction_count: None,
            gas_used: None,
            base_fee_per_gas: None,
            child_index: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoOpReason {
    Empty,
    MissingBlockNumber,
    UnrecognizedShape,
    RpcError(String),
    Undecodable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPayload {
    Ack { subscription: Option<String> },
    Block(BlockFields),
    NoOp(NoOpReason),
}

/// Parses a base-16 quantity, with or without a `0x` prefix.
pub fn parse_hex_quantity(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

pub fn decode_envelope(payload: &mut [u8]) -> Result<FeedEnvelopeWire, AppError> {
    let envelope: FeedEnvelopeWire = simd_json::serde::from_slice(payload)?;
    Ok(envelope)
}

pub fn parse_payload(text: &str) -> ParsedPayload {
    if text.trim().is_empty() {
        return ParsedPayload::NoOp(NoOpReason::Empty);
    }

    let mut owned_payload = text.as_bytes().to_vec();
    match decode_envelope(owned_payload.as_mut_slice()) {
        Ok(envelope) => classify_envelope(envelope),
        Err(error) => {
            tracing::trace!(%error, "strict decode failed, scanning text");
            match scan_block_fields(text) {
                Some(fields) => ParsedPayload::Block(fields),
                None => ParsedPayload::NoOp(NoOpReason::Undecodable),
            }
        }
    }
}

pub fn classify_envelope(envelope: FeedEnvelopeWire) -> ParsedPayload {
    let FeedEnvelopeWire {
        result,
        params,
        error,
        metadata,
        diff,
        base,
        index,
    } = envelope;

    if params.is_none() {
        if let Some(RpcResultWire::Scalar(subscription)) = &result {
            return ParsedPayload::Ack {
                subscription: subscription.to_label(),
            };
        }
    }

    if metadata.is_some() || diff.is_some() || base.is_some() {
        return block_diff_fields(
            metadata.unwrap_or_default(),
            diff.unwrap_or_default(),
            base.unwrap_or_default(),
            index,
        );
    }

    if let Some(NotificationParamsWire {
        result: Some(RpcResultWire::Header(header)),
        ..
    }) = params
    {
        return header_fields(header, PayloadShape::Notification);
    }

    if let Some(RpcResultWire::Header(header)) = result {
        return header_fields(header, PayloadShape::DirectResponse);
    }

    if let Some(error) = error {
        let code = error.code.as_ref().and_then(ErrorCodeWire::to_label);
        let message = error.message.and_then(TextWire::into_text);
        let message = match (code, message) {
            (Some(code), Some(message)) => format!("{code}: {message}"),
            (None, Some(message)) => message,
            (Some(code), None) => format!("code {code}"),
            (None, None) => "unspecified rpc error".to_string(),
        };
        return ParsedPayload::NoOp(NoOpReason::RpcError(message));
    }

    ParsedPayload::NoOp(NoOpReason::UnrecognizedShape)
}

fn block_diff_fields(
    metadata: DiffMetadataWire,
    diff: DiffBodyWire,
    base: DiffBaseWire,
    index: Option<QuantityWire>,
) -> ParsedPayload {
    let number = metadata
        .block_number
        .as_ref()
        .and_then(QuantityWire::to_u64)
        .or_else(|| base.block_number.as_ref().and_then(QuantityWire::to_u64));
    let Some(number) = number else {
        return ParsedPayload::NoOp(NoOpReason::MissingBlockNumber);
    };

    ParsedPayload::Block(BlockFields {
        shape: PayloadShape::BlockDiff,
        number,
        hash: diff.block_hash.and_then(TextWire::into_text),
        timestamp: base.timestamp.as_ref().and_then(QuantityWire::to_u64),
        transaction_count: diff.transactions.as_ref().and_then(ListWire::len),
        gas_used: diff.gas_used.as_ref().and_then(QuantityWire::to_u64),
        base_fee_per_gas: base.base_fee_per_gas.as_ref().and_then(QuantityWire::to_u64),
        child_index: index
            .as_ref()
            .and_then(QuantityWire::to_u64)
            .and_then(|value| u32::try_from(value).ok()),
    })
}

fn header_fields(header: BlockHeaderWire, shape: PayloadShape) -> ParsedPayload {
    let Some(number) = header.number.as_ref().and_then(QuantityWire::to_u64) else {
        return ParsedPayload::NoOp(NoOpReason::MissingBlockNumber);
    };

    ParsedPayload::Block(BlockFields {
        shape,
        number,
        hash: header.hash.and_then(TextWire::into_text),
        timestamp: header.timestamp.as_ref().and_then(QuantityWire::to_u64),
        transaction_count: header.transactions.as_ref().and_then(ListWire::len),
        gas_used: header.gas_used.as_ref().and_then(QuantityWire::to_u64),
        base_fee_per_gas: header
            .base_fee_per_gas
            .as_ref()
            .and_then(QuantityWire::to_u64),
        child_index: None,
    })
}

/// Last-resort extraction from text that is not valid JSON.
pub fn scan_block_fields(text: &str) -> Option<BlockFields> {
    let number = BLOCK_NUMBER_KEYS
        .iter()
        .find_map(|key| scan_quantity(text, key))?;
    let mut fields = BlockFields::bare(PayloadShape::TextScan, number);
    fields.timestamp = scan_quantity(text, TIMESTAMP_KEY);
    Some(fields)
}

fn scan_quantity(text: &str, key: &str) -> Option<u64> {
    let needle = format!("\"{key}\"");
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find(&needle) {
        let after_key = search_from + offset + needle.len();
        if let Some(value) = quantity_after_key(&text[after_key..]) {
            return Some(value);
        }
        search_from = after_key;
    }
    None
}

fn quantity_after_key(rest: &str) -> Option<u64> {
    let rest = rest.trim_start().strip_prefix(':')?.trim_start();
    let (quoted, rest) = match rest.strip_prefix('"') {
        Some(inner) => (true, inner),
        None => (false, rest),
    };

    let token_len = rest
        .find(|ch: char| !ch.is_ascii_alphanumeric())
        .unwrap_or(rest.len());
    let token = &rest[..token_len];
    if token.is_empty() {
        return None;
    }

    if token.starts_with("0x") || token.starts_with("0X") {
        return parse_hex_quantity(token);
    }
    if quoted {
        return parse_hex_quantity(token);
    }
    if token.bytes().all(|byte| byte.is_ascii_digit()) {
        return token.parse::<u64>().ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_block(payload: ParsedPayload) -> BlockFields {
        match payload {
            ParsedPayload::Block(fields) => fields,
            other => panic!("expected block payload, got {other:?}"),
        }
    }

    #[test]
    fn parses_hex_quantities() {
        for value in [0_u64, 1, 15, 16, 255, 0x1234_5678, u64::MAX] {
            assert_eq!(parse_hex_quantity(&format!("0x{value:x}")), Some(value));
            assert_eq!(parse_hex_quantity(&format!("{value:X}")), Some(value));
        }
        assert_eq!(parse_hex_quantity(" 0X1f "), Some(31));
    }

    #[test]
    fn rejects_malformed_hex() {
        for raw in ["", "0x", "0xzz", "+1f", "-1", "0x1 2", "0x10000000000000000", "Unknown"] {
            assert_eq!(parse_hex_quantity(raw), None, "{raw:?} should be rejected");
        }
    }

    #[test]
    fn recognizes_subscription_ack() {
        let parsed = parse_payload(r#"{"jsonrpc":"2.0","id":1,"result":"0xabc"}"#);
        assert_eq!(
            parsed,
            ParsedPayload::Ack {
                subscription: Some("0xabc".to_string())
            }
        );
    }

    #[test]
    fn extracts_block_diff_fields() {
        let fields = expect_block(parse_payload(
            r#"{
                "payload_id":"0x01",
                "index":0,
                "base":{"block_number":"0x64","timestamp":"0x67a0b2c1","base_fee_per_gas":"0x3b9aca00"},
                "diff":{"block_hash":"0xbeef","gas_used":"0x5208","transactions":["0x01","0x02","0x03"]},
                "metadata":{"block_number":100}
            }"#,
        ));

        assert_eq!(fields.shape, PayloadShape::BlockDiff);
        assert_eq!(fields.number, 100);
        assert_eq!(fields.hash.as_deref(), Some("0xbeef"));
        assert_eq!(fields.timestamp, Some(0x67a0_b2c1));
        assert_eq!(fields.transaction_count, Some(3));
        assert_eq!(fields.gas_used, Some(21_000));
        assert_eq!(fields.base_fee_per_gas, Some(1_000_000_000));
        assert_eq!(fields.child_index, Some(0));
    }

    #[test]
    fn block_diff_falls_back_to_base_block_number() {
        let fields = expect_block(parse_payload(
            r#"{"index":3,"base":{"block_number":"0x65"},"diff":{"gas_used":"nope"}}"#,
        ));

        assert_eq!(fields.number, 101);
        assert_eq!(fields.gas_used, None);
        assert_eq!(fields.child_index, Some(3));
    }

    #[test]
    fn block_diff_without_number_is_noop() {
        let parsed = parse_payload(r#"{"diff":{"block_hash":"0xbeef"},"metadata":{}}"#);
        assert_eq!(parsed, ParsedPayload::NoOp(NoOpReason::MissingBlockNumber));
    }

    #[test]
    fn extracts_notification_fields() {
        let fields = expect_block(parse_payload(
            r#"{"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0xabc","result":{"number":"0x1b4","hash":"0xfeed","timestamp":"0x10","gasUsed":"0x0","baseFeePerGas":"0x7"}}}"#,
        ));

        assert_eq!(fields.shape, PayloadShape::Notification);
        assert_eq!(fields.number, 436);
        assert_eq!(fields.hash.as_deref(), Some("0xfeed"));
        assert_eq!(fields.timestamp, Some(16));
        assert_eq!(fields.transaction_count, None);
        assert_eq!(fields.gas_used, Some(0));
        assert_eq!(fields.base_fee_per_gas, Some(7));
    }

    #[test]
    fn notification_keeps_block_when_secondary_fields_are_mistyped() {
        let fields = expect_block(parse_payload(
            r#"{"params":{"subscription":"0xabc","result":{"number":"0x64","hash":12,"transactions":5,"gasUsed":"0x5208","baseFeePerGas":[1]}}}"#,
        ));

        assert_eq!(fields.shape, PayloadShape::Notification);
        assert_eq!(fields.number, 100);
        assert_eq!(fields.hash, None);
        assert_eq!(fields.transaction_count, None);
        assert_eq!(fields.gas_used, Some(21_000));
        assert_eq!(fields.base_fee_per_gas, None);
    }

    #[test]
    fn direct_response_keeps_block_when_secondary_fields_are_mistyped() {
        let fields = expect_block(parse_payload(
            r#"{"id":1,"result":{"number":"0x2a","hash":{"nested":true},"transactions":"many","timestamp":null}}"#,
        ));

        assert_eq!(fields.shape, PayloadShape::DirectResponse);
        assert_eq!(fields.number, 42);
        assert_eq!(fields.hash, None);
        assert_eq!(fields.transaction_count, None);
        assert_eq!(fields.timestamp, None);
    }

    #[test]
    fn block_diff_keeps_block_when_secondary_fields_are_mistyped() {
        let fields = expect_block(parse_payload(
            r#"{"index":2,"metadata":{"block_number":100},"diff":{"block_hash":7,"gas_used":"0x5208","transactions":{"count":3}},"base":{"timestamp":false}}"#,
        ));

        assert_eq!(fields.shape, PayloadShape::BlockDiff);
        assert_eq!(fields.number, 100);
        assert_eq!(fields.child_index, Some(2));
        assert_eq!(fields.hash, None);
        assert_eq!(fields.gas_used, Some(21_000));
        assert_eq!(fields.transaction_count, None);
        assert_eq!(fields.timestamp, None);
    }

    #[test]
    fn block_diff_with_bad_index_drops_only_the_index() {
        for index in [r#""two""#, "-1", "1.5", "[0]", "4294967296"] {
            let payload = format!(
                r#"{{"index":{index},"metadata":{{"block_number":100}},"diff":{{"block_hash":"0xbeef","transactions":["0x01"]}}}}"#
            );
            let fields = expect_block(parse_payload(&payload));

            assert_eq!(fields.shape, PayloadShape::BlockDiff, "index {index}");
            assert_eq!(fields.child_index, None, "index {index}");
            assert_eq!(fields.hash.as_deref(), Some("0xbeef"), "index {index}");
            assert_eq!(fields.transaction_count, Some(1), "index {index}");
        }
    }

    #[test]
    fn rpc_error_with_mistyped_fields_is_still_reported() {
        assert_eq!(
            parse_payload(r#"{"error":{"code":"oops","message":42}}"#),
            ParsedPayload::NoOp(NoOpReason::RpcError("code oops".to_string()))
        );
    }

    #[test]
    fn notification_with_bad_number_is_noop() {
        let parsed =
            parse_payload(r#"{"params":{"result":{"number":"0xnope","timestamp":"0x10"}}}"#);
        assert_eq!(parsed, ParsedPayload::NoOp(NoOpReason::MissingBlockNumber));
    }

    #[test]
    fn extracts_direct_response_fields() {
        let fields = expect_block(parse_payload(
            r#"{"jsonrpc":"2.0","id":7,"result":{"number":"0x2a","transactions":[{"hash":"0x1"}]}}"#,
        ));

        assert_eq!(fields.shape, PayloadShape::DirectResponse);
        assert_eq!(fields.number, 42);
        assert_eq!(fields.transaction_count, Some(1));
    }

    #[test]
    fn block_diff_wins_over_rpc_shapes() {
        let fields = expect_block(parse_payload(
            r#"{"metadata":{"block_number":9},"params":{"result":{"number":"0x1"}}}"#,
        ));

        assert_eq!(fields.shape, PayloadShape::BlockDiff);
        assert_eq!(fields.number, 9);
    }

    #[test]
    fn surfaces_rpc_errors_as_noop() {
        let parsed = parse_payload(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"method not found"}}"#,
        );
        assert_eq!(
            parsed,
            ParsedPayload::NoOp(NoOpReason::RpcError("-32601: method not found".to_string()))
        );
    }

    #[test]
    fn unknown_json_is_noop() {
        assert_eq!(
            parse_payload(r#"{"hello":"world"}"#),
            ParsedPayload::NoOp(NoOpReason::UnrecognizedShape)
        );
        assert_eq!(parse_payload("   "), ParsedPayload::NoOp(NoOpReason::Empty));
    }

    #[test]
    fn scans_truncated_json_for_hex_fields() {
        let fields = expect_block(parse_payload(
            r#"{"params":{"result":{"timestamp": "0x20", "number":"0x1f4", "hash":"0x"#,
        ));

        assert_eq!(fields.shape, PayloadShape::TextScan);
        assert_eq!(fields.number, 500);
        assert_eq!(fields.timestamp, Some(32));
    }

    #[test]
    fn scans_decimal_block_number() {
        let fields = expect_block(parse_payload(r#"garbage "block_number": 77 trailing"#));
        assert_eq!(fields.number, 77);
        assert_eq!(fields.timestamp, None);
    }

    #[test]
    fn garbage_without_fields_is_undecodable() {
        let lossy = String::from_utf8_lossy(&[0x1f, 0x8b, 0x08, 0xff, 0xfe, 0x00, 0x42]);
        assert_eq!(
            parse_payload(&lossy),
            ParsedPayload::NoOp(NoOpReason::Undecodable)
        );
        assert_eq!(
            parse_payload(r#"{"number": "0xzz""#),
            ParsedPayload::NoOp(NoOpReason::Undecodable)
        );
    }
}
