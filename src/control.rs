//! Protocol controls and the OID registry that encodes and decodes them.
//!
//! Request controls are typed values the caller attaches to an operation;
//! [`ControlRegistry::encode_request_controls`] turns them into raw
//! [`Control`] envelopes for the backend. Raw controls coming back from the
//! backend are decoded by OID into [`ResponseControl`]s. A response control
//! without a registered decoder passes through as [`ResponseControl::Opaque`]
//! unless it is marked critical, in which case decoding fails.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::ber::{
    context_tag, decode_boolean, decode_integer, decode_string, BerParser, BerPath, BerWriter,
    TagSelector,
};
use crate::error::{LdapError, LdapResult};
use crate::result_code::ResultCode;

/// RFC 2696 simple paged results.
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";
/// RFC 2891 server side sort request.
pub const SORT_REQUEST_OID: &str = "1.2.840.113556.1.4.473";
/// RFC 2891 server side sort response.
pub const SORT_RESPONSE_OID: &str = "1.2.840.113556.1.4.474";

/// Control envelope as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

impl Control {
    pub fn new(oid: impl Into<String>, critical: bool, value: Option<Vec<u8>>) -> Self {
        Self {
            oid: oid.into(),
            critical,
            value,
        }
    }
}

/// Which side of an exchange a control may appear on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlDirection {
    RequestOnly,
    ResponseOnly,
    Both,
}

impl ControlDirection {
    fn allows_response(self) -> bool {
        matches!(self, ControlDirection::ResponseOnly | ControlDirection::Both)
    }
}

/// Paged results value: `SEQUENCE { size INTEGER, cookie OCTET STRING }`.
///
/// On a request `size` is the page size and `cookie` is empty for the first
/// page. On a response `size` is the server's result set estimate and an
/// empty cookie means the last page was delivered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PagedResultsControl {
    pub size: i32,
    pub cookie: Vec<u8>,
    pub critical: bool,
}

impl PagedResultsControl {
    pub fn new(size: i32) -> Self {
        Self {
            size,
            cookie: Vec::new(),
            critical: false,
        }
    }

    pub fn with_cookie(mut self, cookie: Vec<u8>) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn to_control(&self) -> Control {
        let mut writer = BerWriter::new();
        let seq = writer.start_sequence();
        writer.write_integer(self.size as i64);
        writer.write_octet_string(&self.cookie);
        writer.end_sequence(seq);
        Control::new(PAGED_RESULTS_OID, self.critical, Some(writer.into_vec()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub attribute: String,
    pub ordering_rule: Option<String>,
    pub reverse: bool,
}

impl SortKey {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            ordering_rule: None,
            reverse: false,
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }
}

/// Server side sort request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortRequestControl {
    pub keys: Vec<SortKey>,
    pub critical: bool,
}

impl SortRequestControl {
    pub fn to_control(&self) -> Control {
        // SortKeyList ::= SEQUENCE OF SEQUENCE {
        //     attributeType   OCTET STRING,
        //     orderingRule    [0] OCTET STRING OPTIONAL,
        //     reverseOrder    [1] BOOLEAN DEFAULT FALSE }
        let mut writer = BerWriter::new();
        let list = writer.start_sequence();
        for key in &self.keys {
            let seq = writer.start_sequence();
            writer.write_string(&key.attribute);
            if let Some(rule) = &key.ordering_rule {
                writer.write_tagged(context_tag(0, false), rule.as_bytes());
            }
            if key.reverse {
                writer.write_tagged(context_tag(1, false), &[0xFF]);
            }
            writer.end_sequence(seq);
        }
        writer.end_sequence(list);
        Control::new(SORT_REQUEST_OID, self.critical, Some(writer.into_vec()))
    }
}

/// Server side sort result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortResponseControl {
    pub sort_result: ResultCode,
    pub attribute_name: Option<String>,
    pub critical: bool,
}

impl SortResponseControl {
    pub fn to_control(&self) -> Control {
        let mut writer = BerWriter::new();
        let seq = writer.start_sequence();
        writer.write_enumerated(self.sort_result.code() as i64);
        if let Some(name) = &self.attribute_name {
            writer.write_tagged(context_tag(0, false), name.as_bytes());
        }
        writer.end_sequence(seq);
        Control::new(SORT_RESPONSE_OID, self.critical, Some(writer.into_vec()))
    }
}

/// Control attached by the caller to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestControl {
    PagedResults(PagedResultsControl),
    Sort(SortRequestControl),
    /// Pre-encoded control sent as is.
    Raw(Control),
}

impl RequestControl {
    pub fn oid(&self) -> &str {
        match self {
            RequestControl::PagedResults(_) => PAGED_RESULTS_OID,
            RequestControl::Sort(_) => SORT_REQUEST_OID,
            RequestControl::Raw(c) => &c.oid,
        }
    }

    /// OID of the control a server answers this request control with.
    pub fn response_oid(&self) -> &str {
        match self {
            RequestControl::Sort(_) => SORT_RESPONSE_OID,
            other => other.oid(),
        }
    }
}

/// Decoded response control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseControl {
    PagedResults(PagedResultsControl),
    SortResponse(SortResponseControl),
    /// No decoder registered; carried undecoded.
    Opaque(Control),
}

impl ResponseControl {
    pub fn oid(&self) -> &str {
        match self {
            ResponseControl::PagedResults(_) => PAGED_RESULTS_OID,
            ResponseControl::SortResponse(_) => SORT_RESPONSE_OID,
            ResponseControl::Opaque(c) => &c.oid,
        }
    }
}

pub type ResponseDecoder = Arc<dyn Fn(&Control) -> LdapResult<ResponseControl> + Send + Sync>;

struct Registration {
    direction: ControlDirection,
    decoder: Option<ResponseDecoder>,
}

/// OID keyed control catalog. Built once and shared read-only.
pub struct ControlRegistry {
    entries: HashMap<String, Registration>,
}

impl fmt::Debug for ControlRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut oids: Vec<&String> = self.entries.keys().collect();
        oids.sort();
        f.debug_struct("ControlRegistry").field("oids", &oids).finish()
    }
}

impl Default for ControlRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ControlRegistry {
    /// Registry with no controls. Every response control is opaque.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registry knowing paged results and server side sorting.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(
            PAGED_RESULTS_OID,
            ControlDirection::Both,
            Some(paged_results_decoder()),
        );
        registry.register(SORT_REQUEST_OID, ControlDirection::RequestOnly, None);
        registry.register(
            SORT_RESPONSE_OID,
            ControlDirection::ResponseOnly,
            Some(sort_response_decoder()),
        );
        registry
    }

    pub fn register(
        &mut self,
        oid: impl Into<String>,
        direction: ControlDirection,
        decoder: Option<ResponseDecoder>,
    ) {
        self.entries
            .insert(oid.into(), Registration { direction, decoder });
    }

    pub fn direction(&self, oid: &str) -> Option<ControlDirection> {
        self.entries.get(oid).map(|r| r.direction)
    }

    pub fn encode_request_controls(&self, controls: &[RequestControl]) -> LdapResult<Vec<Control>> {
        controls
            .iter()
            .map(|control| {
                if self.direction(control.oid()) == Some(ControlDirection::ResponseOnly) {
                    return Err(LdapError::config(format!(
                        "Control {} cannot be sent on a request",
                        control.oid()
                    )));
                }
                Ok(match control {
                    RequestControl::PagedResults(paged) => paged.to_control(),
                    RequestControl::Sort(sort) => sort.to_control(),
                    RequestControl::Raw(raw) => raw.clone(),
                })
            })
            .collect()
    }

    pub fn decode_response_controls(
        &self,
        raw: &[Control],
        requested: &[RequestControl],
    ) -> LdapResult<Vec<ResponseControl>> {
        let mut decoded = Vec::with_capacity(raw.len());
        for control in raw {
            if !requested.iter().any(|r| r.response_oid() == control.oid) {
                debug!("Server returned unsolicited response control {}", control.oid);
            }
            let decoder = self
                .entries
                .get(&control.oid)
                .filter(|r| r.direction.allows_response())
                .and_then(|r| r.decoder.as_ref());
            match decoder {
                Some(decode) => decoded.push(decode(control)?),
                None if control.critical => {
                    return Err(LdapError::decode(format!(
                        "Unrecognized critical response control {}",
                        control.oid
                    )));
                }
                None => decoded.push(ResponseControl::Opaque(control.clone())),
            }
        }
        Ok(decoded)
    }
}

/// True when the decoded controls ask the caller to reissue the operation
/// for more results.
pub fn continuation_requested(controls: &[ResponseControl]) -> bool {
    continuation_cookie(controls).is_some()
}

/// Non-empty paged results cookie, if the server returned one.
pub fn continuation_cookie(controls: &[ResponseControl]) -> Option<&[u8]> {
    controls.iter().find_map(|c| match c {
        ResponseControl::PagedResults(paged) if !paged.cookie.is_empty() => {
            Some(paged.cookie.as_slice())
        }
        _ => None,
    })
}

pub fn find_sort_response(controls: &[ResponseControl]) -> Option<&SortResponseControl> {
    controls.iter().find_map(|c| match c {
        ResponseControl::SortResponse(sort) => Some(sort),
        _ => None,
    })
}

fn control_value<'a>(control: &'a Control) -> LdapResult<&'a [u8]> {
    control
        .value
        .as_deref()
        .ok_or_else(|| LdapError::decode(format!("Control {} has no value", control.oid)))
}

#[derive(Default)]
struct PagedState {
    size: Option<i32>,
    cookie: Option<Vec<u8>>,
}

fn paged_results_decoder() -> ResponseDecoder {
    let mut parser = BerParser::<PagedState>::new();
    parser
        .register_handler(
            BerPath::new(&[TagSelector::Seq, TagSelector::Int]),
            |state, value| {
                let size = decode_integer(value)?;
                state.size = Some(i32::try_from(size).map_err(|_| {
                    LdapError::decode(format!("Paged results size out of range: {}", size))
                })?);
                Ok(())
            },
        )
        .register_handler(
            BerPath::new(&[TagSelector::Seq, TagSelector::OctStr]),
            |state, value| {
                state.cookie = Some(value.to_vec());
                Ok(())
            },
        );

    Arc::new(move |control: &Control| -> LdapResult<ResponseControl> {
        let mut state = PagedState::default();
        parser.parse(control_value(control)?, &mut state)?;
        match (state.size, state.cookie) {
            (Some(size), Some(cookie)) => Ok(ResponseControl::PagedResults(PagedResultsControl {
                size,
                cookie,
                critical: control.critical,
            })),
            _ => Err(LdapError::decode("Paged results control missing size or cookie")),
        }
    })
}

#[derive(Default)]
struct SortState {
    sort_result: Option<ResultCode>,
    attribute_name: Option<String>,
}

fn sort_response_decoder() -> ResponseDecoder {
    fn attribute(state: &mut SortState, value: &[u8]) -> LdapResult<()> {
        state.attribute_name = Some(decode_string(value)?);
        Ok(())
    }

    let mut parser = BerParser::<SortState>::new();
    parser
        .register_handler(
            BerPath::new(&[TagSelector::Seq, TagSelector::Enum]),
            |state, value| {
                state.sort_result = Some(ResultCode::try_from(decode_integer(value)?)?);
                Ok(())
            },
        )
        // RFC 2891 tags attributeType [0]; some servers send [1].
        .register_handler(BerPath::new(&[TagSelector::Seq, TagSelector::Ctx(0)]), attribute)
        .register_handler(BerPath::new(&[TagSelector::Seq, TagSelector::Ctx(1)]), attribute);

    Arc::new(move |control: &Control| -> LdapResult<ResponseControl> {
        let mut state = SortState::default();
        parser.parse(control_value(control)?, &mut state)?;
        let sort_result = state
            .sort_result
            .ok_or_else(|| LdapError::decode("Sort response control missing sortResult"))?;
        Ok(ResponseControl::SortResponse(SortResponseControl {
            sort_result,
            attribute_name: state.attribute_name,
            critical: control.critical,
        }))
    })
}

/// Decodes a raw BOOLEAN-valued control, for callers registering their own
/// simple flag controls.
pub fn decode_flag_value(control: &Control) -> LdapResult<bool> {
    let nodes = crate::ber::parse(control_value(control)?)?;
    match nodes.first() {
        Some(node) if TagSelector::Bool.matches(node.tag) => decode_boolean(&node.value),
        _ => Err(LdapError::decode(format!(
            "Control {} value is not a BOOLEAN",
            control.oid
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_response_no_such_attribute() {
        // SEQUENCE { ENUMERATED 16, [0] "cn" }
        let raw = Control::new(
            SORT_RESPONSE_OID,
            false,
            Some(vec![0x30, 0x07, 0x0A, 0x01, 0x10, 0x80, 0x02, b'c', b'n']),
        );
        let registry = ControlRegistry::with_defaults();
        let decoded = registry.decode_response_controls(&[raw], &[]).unwrap();
        let sort = find_sort_response(&decoded).unwrap();
        assert_eq!(sort.sort_result, ResultCode::NoSuchAttribute);
        assert_eq!(sort.attribute_name.as_deref(), Some("cn"));
    }

    #[test]
    fn test_sort_response_context_one_accepted() {
        let raw = Control::new(
            SORT_RESPONSE_OID,
            false,
            Some(vec![0x30, 0x07, 0x0A, 0x01, 0x10, 0x81, 0x02, b'c', b'n']),
        );
        let decoded = ControlRegistry::with_defaults()
            .decode_response_controls(&[raw], &[])
            .unwrap();
        assert_eq!(
            find_sort_response(&decoded).unwrap().attribute_name.as_deref(),
            Some("cn")
        );
    }

    #[test]
    fn test_sort_response_unknown_result_code() {
        let raw = Control::new(
            SORT_RESPONSE_OID,
            false,
            Some(vec![0x30, 0x03, 0x0A, 0x01, 0x09]),
        );
        let err = ControlRegistry::with_defaults()
            .decode_response_controls(&[raw], &[])
            .unwrap_err();
        assert!(matches!(err, LdapError::Decode(_)));
    }

    #[test]
    fn test_sort_response_encode_decode() {
        let control = SortResponseControl {
            sort_result: ResultCode::Success,
            attribute_name: None,
            critical: false,
        };
        let decoded = ControlRegistry::with_defaults()
            .decode_response_controls(&[control.to_control()], &[])
            .unwrap();
        assert_eq!(decoded, vec![ResponseControl::SortResponse(control)]);
    }

    #[test]
    fn test_unknown_critical_control_fails() {
        let raw = Control::new("1.2.3.4.5", true, Some(vec![0x04, 0x00]));
        let err = ControlRegistry::with_defaults()
            .decode_response_controls(&[raw], &[])
            .unwrap_err();
        assert!(matches!(err, LdapError::Decode(_)));
    }

    #[test]
    fn test_unknown_non_critical_control_is_opaque() {
        let raw = Control::new("1.2.3.4.5", false, Some(vec![0x04, 0x00]));
        let decoded = ControlRegistry::with_defaults()
            .decode_response_controls(&[raw.clone()], &[])
            .unwrap();
        assert_eq!(decoded, vec![ResponseControl::Opaque(raw)]);
    }

    #[test]
    fn test_request_only_control_in_response_is_not_decoded() {
        let raw = Control::new(SORT_REQUEST_OID, true, Some(vec![0x30, 0x00]));
        let err = ControlRegistry::with_defaults()
            .decode_response_controls(&[raw], &[])
            .unwrap_err();
        assert!(matches!(err, LdapError::Decode(_)));
    }

    #[test]
    fn test_paged_results_encoding() {
        let control = PagedResultsControl::new(100).to_control();
        assert_eq!(control.oid, PAGED_RESULTS_OID);
        assert_eq!(
            control.value.unwrap(),
            vec![0x30, 0x05, 0x02, 0x01, 0x64, 0x04, 0x00]
        );
    }

    #[test]
    fn test_paged_results_continuation() {
        let registry = ControlRegistry::with_defaults();
        let requested = vec![RequestControl::PagedResults(PagedResultsControl::new(2))];

        let more = PagedResultsControl::new(0).with_cookie(b"page-2".to_vec()).to_control();
        let decoded = registry.decode_response_controls(&[more], &requested).unwrap();
        assert!(continuation_requested(&decoded));
        assert_eq!(continuation_cookie(&decoded), Some(&b"page-2"[..]));

        let last = PagedResultsControl::new(0).to_control();
        let decoded = registry.decode_response_controls(&[last], &requested).unwrap();
        assert!(!continuation_requested(&decoded));
    }

    #[test]
    fn test_paged_results_missing_value() {
        let raw = Control::new(PAGED_RESULTS_OID, false, None);
        assert!(ControlRegistry::with_defaults()
            .decode_response_controls(&[raw], &[])
            .is_err());
    }

    #[test]
    fn test_sort_request_encoding() {
        let sort = SortRequestControl {
            keys: vec![
                SortKey::new("sn"),
                SortKey {
                    attribute: "cn".to_string(),
                    ordering_rule: Some("2.5.13.3".to_string()),
                    reverse: true,
                },
            ],
            critical: true,
        };
        let control = sort.to_control();
        assert!(control.critical);
        let nodes = crate::ber::parse(control.value.as_deref().unwrap()).unwrap();
        let keys = &nodes[0].children;
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].children.len(), 1);
        assert_eq!(keys[0].children[0].value, b"sn");
        assert_eq!(keys[1].children.len(), 3);
        assert_eq!(keys[1].children[1].tag, 0x80);
        assert_eq!(keys[1].children[2].tag, 0x81);
        assert_eq!(keys[1].children[2].value, vec![0xFF]);
    }

    #[test]
    fn test_encode_request_controls() {
        let registry = ControlRegistry::with_defaults();
        let raw = Control::new("1.3.6.1.4.1.42.2.27.8.5.1", false, None);
        let encoded = registry
            .encode_request_controls(&[
                RequestControl::PagedResults(PagedResultsControl::new(10)),
                RequestControl::Raw(raw.clone()),
            ])
            .unwrap();
        assert_eq!(encoded.len(), 2);
        assert_eq!(encoded[0].oid, PAGED_RESULTS_OID);
        assert_eq!(encoded[1], raw);

        let response_only = RequestControl::Raw(Control::new(SORT_RESPONSE_OID, false, None));
        assert!(registry.encode_request_controls(&[response_only]).is_err());
    }

    #[test]
    fn test_custom_decoder_registration() {
        let decoder: ResponseDecoder = Arc::new(|c: &Control| -> LdapResult<ResponseControl> {
            let flag = decode_flag_value(c)?;
            Ok(ResponseControl::Opaque(Control::new("1.2.3", flag, None)))
        });
        let mut registry = ControlRegistry::empty();
        registry.register("1.2.3", ControlDirection::ResponseOnly, Some(decoder));
        let decoded = registry
            .decode_response_controls(&[Control::new("1.2.3", true, Some(vec![0x01, 0x01, 0xFF]))], &[])
            .unwrap();
        assert_eq!(decoded, vec![ResponseControl::Opaque(Control::new("1.2.3", true, None))]);
    }
}
