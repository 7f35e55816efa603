//! Integration tests for the zentinel-wss crate.
//!
//! These tests exercise the public API end-to-end: configuration, the
//! outbound and inbound chains, and policy verdicts.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use proptest::prelude::*;
use zentinel_wss::chain::{Placement, ProcessingUnit, ProcessorChain, UnitContext, UnitId};
use zentinel_wss::event::StreamEvent;
use zentinel_wss::ns::{SOAP_11_NS, WSSE_NS, WST_NS_05_12, WSU_NS};
use zentinel_wss::{fault_response, PolicyVerdict, SecurityEvent, WssConfig, WssEngine, WssError};

// ============================================================================
// Helpers
// ============================================================================

fn message(body: &str) -> String {
    format!(
        r#"<soap:Envelope xmlns:soap="{}"><soap:Header><h:Session xmlns:h="urn:h" soap:mustUnderstand="1">s-77</h:Session><t:Token xmlns:t="urn:t" xmlns:wsu="{}" wsu:Id="tok-1">token-bytes</t:Token></soap:Header><soap:Body>{}</soap:Body></soap:Envelope>"#,
        SOAP_11_NS, WSU_NS, body
    )
}

fn order(item: &str) -> String {
    format!(r#"<m:Order xmlns:m="urn:orders"><m:Item>{}</m:Item></m:Order>"#, item)
}

/// Config with one HMAC key, one AES key and one Ed25519 key; `extra` is
/// appended verbatim.
fn config(actions: &str, extra: &str) -> WssConfig {
    let yaml = format!(
        r#"
version: "1"
settings:
  actions: [{actions}]
signature:
  token_id: mac-key
encryption:
  token_id: aes-key
tokens:
  - id: mac-key
    kind: symmetric
    key: "{mac}"
  - id: aes-key
    kind: symmetric
    key: "{aes}"
  - id: signer
    kind: ed25519
    key: "{seed}"
{extra}
"#,
        actions = actions,
        mac = BASE64.encode([11u8; 32]),
        aes = BASE64.encode([22u8; 32]),
        seed = BASE64.encode([33u8; 32]),
        extra = extra,
    );
    WssConfig::from_yaml(&yaml).unwrap()
}

fn engine(actions: &str) -> WssEngine {
    WssEngine::from_config(config(actions, "")).unwrap()
}

fn set_token_key(config: &mut WssConfig, id: &str, key: [u8; 32]) {
    let token = config.tokens.iter_mut().find(|t| t.id == id).unwrap();
    token.key = Some(BASE64.encode(key));
}

fn distrust(config: &mut WssConfig, id: &str) {
    config.tokens.iter_mut().find(|t| t.id == id).unwrap().trusted = false;
}

/// Replace the content of the first `ds:KeyInfo` following `owner`.
fn replace_key_info(xml: &str, owner: &str, content: &str) -> String {
    let owner_at = xml.find(owner).unwrap();
    let open = owner_at + xml[owner_at..].find("<ds:KeyInfo").unwrap();
    let start = open + xml[open..].find('>').unwrap() + 1;
    let end = start + xml[start..].find("</ds:KeyInfo>").unwrap();
    format!("{}{}{}", &xml[..start], content, &xml[end..])
}

fn inline_secret(key: [u8; 32]) -> String {
    format!(
        r#"<wst:BinarySecret xmlns:wst="{}">{}</wst:BinarySecret>"#,
        WST_NS_05_12,
        BASE64.encode(key)
    )
}

fn body_of(xml: &str) -> &str {
    let start = xml.find("<soap:Body").unwrap();
    let end = xml.find("</soap:Body>").unwrap();
    &xml[start..end]
}

fn count<F: Fn(&SecurityEvent) -> bool>(events: &[SecurityEvent], f: F) -> usize {
    events.iter().filter(|e| f(e)).count()
}

// ============================================================================
// Encryption
// ============================================================================

#[test]
fn test_e2e_body_encrypt_decrypt() {
    let engine = engine("encrypt");
    let original = message(&order("42"));
    let secured = engine.secure(&original).unwrap();
    assert!(!secured.xml.contains("<m:Item>"));
    assert!(secured.xml.contains("<xenc:ReferenceList>"));

    let verified = engine.verify(&secured.xml).unwrap();
    assert_eq!(body_of(&verified.xml), body_of(&original));
    assert_eq!(
        count(&verified.events, |e| matches!(e, SecurityEvent::EncryptedElement { content_only: true, .. })),
        1
    );
}

#[test]
fn test_e2e_header_at_depth_three_encrypted() {
    let mut config = config(
        "encrypt",
        r#"
policy:
  kind: encrypted_elements
  paths: ["/{http://schemas.xmlsoap.org/soap/envelope/}Envelope/{http://schemas.xmlsoap.org/soap/envelope/}Header/{urn:h}Session"]
"#,
    );
    config.encryption.parts = vec![zentinel_wss::config::SecurePartConfig {
        element: Some("{urn:h}Session".to_string()),
        ..Default::default()
    }];
    let engine = WssEngine::from_config(config).unwrap();

    let secured = engine.secure(&message(&order("1"))).unwrap();
    assert!(!secured.xml.contains("s-77"));
    assert_eq!(secured.xml.matches("<wsse11:EncryptedHeader").count(), 1);
    assert_eq!(secured.xml.matches("<xenc:EncryptedData").count(), 1);
    let wrapper = &secured.xml[secured.xml.find("<wsse11:EncryptedHeader").unwrap()..];
    let wrapper_start = &wrapper[..wrapper.find('>').unwrap()];
    assert!(wrapper_start.contains("soap:mustUnderstand=\"1\""));
    assert!(!wrapper_start.contains("wsu:Id"));

    let verified = engine.verify(&secured.xml).unwrap();
    assert!(verified.xml.contains(">s-77</h:Session>"));
    assert!(!verified.xml.contains("EncryptedHeader"));
    assert_eq!(verified.verdict, Some(PolicyVerdict::Satisfied { alternative: 0 }));
}

#[test]
fn test_e2e_tampered_ciphertext_rejected() {
    let engine = engine("encrypt");
    let secured = engine.secure(&message(&order("42"))).unwrap();
    let start = secured.xml.find("<xenc:CipherValue>").unwrap() + "<xenc:CipherValue>".len();
    let mut tampered = secured.xml.clone();
    let replacement = if &tampered[start..start + 1] == "A" { "B" } else { "A" };
    tampered.replace_range(start..start + 1, replacement);

    let err = engine.verify(&tampered).unwrap_err();
    assert!(matches!(err, WssError::DecryptionFailed(_)));
    assert_eq!(engine.stats().rejected, 1);
}

// ============================================================================
// Signature
// ============================================================================

#[test]
fn test_e2e_sign_verify_and_tamper() {
    let engine = engine("timestamp, signature");
    let secured = engine.secure(&message(&order("42"))).unwrap();
    assert!(secured.xml.contains("<ds:SignatureValue>"));

    let verified = engine.verify(&secured.xml).unwrap();
    assert!(verified.accepted);
    assert_eq!(count(&verified.events, |e| matches!(e, SecurityEvent::ReferenceMatched { .. })), 1);

    let tampered = secured.xml.replace("<m:Item>42<", "<m:Item>43<");
    assert_ne!(tampered, secured.xml);
    let err = engine.verify(&tampered).unwrap_err();
    assert!(matches!(err, WssError::SignatureVerificationFailed(_)));

    let fault = fault_response(&tampered, err.fault_code(), &err.to_string());
    assert!(fault.contains("wsse:FailedCheck"));
}

#[test]
fn test_e2e_sign_then_encrypt() {
    let engine = engine("timestamp, signature, encrypt");
    let secured = engine.secure(&message(&order("42"))).unwrap();
    let verified = engine.verify(&secured.xml).unwrap();
    assert!(verified.xml.contains("<m:Item>42</m:Item>"));
    assert_eq!(count(&verified.events, |e| matches!(e, SecurityEvent::Timestamp { .. })), 1);
    assert_eq!(count(&verified.events, |e| matches!(e, SecurityEvent::SignedElement { .. })), 1);
    assert_eq!(engine.stats().verified, 1);
}

#[test]
fn test_e2e_str_reference_signed() {
    let mut config = config(
        "signature",
        r#"
policy:
  kind: signed_elements
  paths: ["/{http://schemas.xmlsoap.org/soap/envelope/}Envelope/{http://schemas.xmlsoap.org/soap/envelope/}Header/{urn:t}Token"]
"#,
    );
    config.signature.parts.push(zentinel_wss::config::SecurePartConfig {
        token_id: Some("tok-1".to_string()),
        reference_id: Some("str-1".to_string()),
        ..Default::default()
    });
    let engine = WssEngine::from_config(config).unwrap();

    let secured = engine.secure(&message(&order("42"))).unwrap();
    assert!(secured.xml.contains("URI=\"#str-1\""));
    assert!(secured.xml.contains("URI=\"#tok-1\""));

    let verified = engine.verify(&secured.xml).unwrap();
    assert_eq!(verified.verdict, Some(PolicyVerdict::Satisfied { alternative: 0 }));
    assert_eq!(count(&verified.events, |e| matches!(e, SecurityEvent::ReferenceMatched { .. })), 2);

    let tampered = secured.xml.replace(">token-bytes<", ">token-bytez<");
    assert!(matches!(
        engine.verify(&tampered),
        Err(WssError::SignatureVerificationFailed(_))
    ));
}

#[test]
fn test_e2e_nested_match_signed_once() {
    let mut config = config("signature", "");
    config.signature.parts = vec![zentinel_wss::config::SecurePartConfig {
        element: Some("{urn:x}A".to_string()),
        ..Default::default()
    }];
    let engine = WssEngine::from_config(config).unwrap();

    let secured = engine
        .secure(&message(r#"<x:A xmlns:x="urn:x"><x:A>inner</x:A></x:A>"#))
        .unwrap();
    assert_eq!(count(&secured.events, |e| matches!(e, SecurityEvent::SignedElement { .. })), 1);
    assert_eq!(secured.xml.matches("<ds:Reference ").count(), 1);
    assert!(engine.verify(&secured.xml).is_ok());
}

#[test]
fn test_e2e_ed25519_protection_token() {
    let mut config = config(
        "signature",
        r#"
policy:
  kind: all
  of:
    - kind: protection_token
      token_type: ed25519
"#,
    );
    config.signature.token_id = "signer".to_string();
    config.signature.signature_algorithm = zentinel_wss::algorithm::ED25519.to_string();
    let engine = WssEngine::from_config(config).unwrap();

    let secured = engine.secure(&message(&order("42"))).unwrap();
    let verified = engine.verify(&secured.xml).unwrap();
    assert_eq!(verified.verdict, Some(PolicyVerdict::Satisfied { alternative: 0 }));
}

// ============================================================================
// Key trust
// ============================================================================

#[test]
fn test_e2e_signature_with_inline_key_rejected() {
    // Signed with a key the verifier has never seen, which the message then carries
    let mut forger = config("signature", "");
    set_token_key(&mut forger, "mac-key", [99u8; 32]);
    let forger = WssEngine::from_config(forger).unwrap();
    let forged = forger.secure(&message("<m:Pay xmlns:m=\"urn:m\">1000000</m:Pay>")).unwrap();
    let forged = replace_key_info(&forged.xml, "<ds:Signature", &inline_secret([99u8; 32]));
    assert!(forged.contains("BinarySecret"));

    let engine = engine("signature");
    let err = engine.verify(&forged).unwrap_err();
    assert!(matches!(err, WssError::TrustValidationFailed(_)));
    assert!(fault_response(&forged, err.fault_code(), &err.to_string()).contains("wsse:InvalidSecurityToken"));
    assert_eq!(engine.stats().rejected, 1);
}

#[test]
fn test_e2e_signature_with_unregistered_token_rejected() {
    let engine = engine("signature");
    let secured = engine.secure(&message(&order("42"))).unwrap();
    let renamed = secured.xml.replace("URI=\"#mac-key\"", "URI=\"#ghost\"");
    assert_ne!(renamed, secured.xml);
    assert!(matches!(
        engine.verify(&renamed),
        Err(WssError::KeyResolutionFailed(_))
    ));
}

#[test]
fn test_e2e_signature_with_untrusted_token_rejected() {
    let secured = engine("signature").secure(&message(&order("42"))).unwrap();

    let mut config = config("signature", "");
    distrust(&mut config, "mac-key");
    let verifier = WssEngine::from_config(config).unwrap();
    assert!(matches!(
        verifier.verify(&secured.xml),
        Err(WssError::TrustValidationFailed(_))
    ));
}

#[test]
fn test_e2e_untrusted_ed25519_token_rejected() {
    let mut config = config("signature", "");
    config.signature.token_id = "signer".to_string();
    config.signature.signature_algorithm = zentinel_wss::algorithm::ED25519.to_string();
    let secured = WssEngine::from_config(config.clone())
        .unwrap()
        .secure(&message(&order("42")))
        .unwrap();

    distrust(&mut config, "signer");
    let verifier = WssEngine::from_config(config).unwrap();
    assert!(matches!(
        verifier.verify(&secured.xml),
        Err(WssError::TrustValidationFailed(_))
    ));
}

#[test]
fn test_e2e_decrypt_with_inline_key_rejected() {
    let engine = engine("encrypt");
    let secured = engine.secure(&message(&order("42"))).unwrap();
    // Even the correct key is refused when the message supplies it
    let inlined = replace_key_info(&secured.xml, "<xenc:EncryptedData", &inline_secret([22u8; 32]));
    assert!(matches!(
        engine.verify(&inlined),
        Err(WssError::TrustValidationFailed(_))
    ));
}

#[test]
fn test_e2e_decrypt_with_untrusted_or_unknown_token_rejected() {
    let secured = engine("encrypt").secure(&message(&order("42"))).unwrap();

    let mut config = config("encrypt", "");
    distrust(&mut config, "aes-key");
    let verifier = WssEngine::from_config(config).unwrap();
    assert!(matches!(
        verifier.verify(&secured.xml),
        Err(WssError::TrustValidationFailed(_))
    ));

    let renamed = secured.xml.replace("URI=\"#aes-key\"", "URI=\"#ghost\"");
    assert_ne!(renamed, secured.xml);
    assert!(matches!(
        engine("encrypt").verify(&renamed),
        Err(WssError::KeyResolutionFailed(_))
    ));
}

// ============================================================================
// Timestamp
// ============================================================================

#[test]
fn test_e2e_expired_timestamp_rejected() {
    let engine = engine("timestamp");
    let xml = format!(
        r#"<soap:Envelope xmlns:soap="{}"><soap:Header><wsse:Security xmlns:wsse="{}" xmlns:wsu="{}"><wsu:Timestamp wsu:Id="TS-1"><wsu:Created>2001-01-01T00:00:00Z</wsu:Created><wsu:Expires>2001-01-01T00:05:00Z</wsu:Expires></wsu:Timestamp></wsse:Security></soap:Header><soap:Body/></soap:Envelope>"#,
        SOAP_11_NS, WSSE_NS, WSU_NS
    );
    let err = engine.verify(&xml).unwrap_err();
    assert!(matches!(err, WssError::MessageExpired(_)));
    assert!(fault_response(&xml, err.fault_code(), &err.to_string()).contains("wsse:MessageExpired"));
}

#[test]
fn test_e2e_timestamp_round_trip() {
    let engine = engine("timestamp");
    let secured = engine.secure(&message(&order("1"))).unwrap();
    assert!(secured.xml.contains("<wsu:Created>"));
    let verified = engine.verify(&secured.xml).unwrap();
    assert_eq!(count(&verified.events, |e| matches!(e, SecurityEvent::Timestamp { .. })), 1);
}

// ============================================================================
// Policy
// ============================================================================

fn two_alternative_engine() -> WssEngine {
    let config = config(
        "",
        r#"
policy:
  kind: exactly_one
  of:
    - kind: required_elements
      paths: ["/{http://schemas.xmlsoap.org/soap/envelope/}Envelope/{http://schemas.xmlsoap.org/soap/envelope/}Body/{urn:x}A"]
    - kind: required_elements
      paths: ["/{http://schemas.xmlsoap.org/soap/envelope/}Envelope/{http://schemas.xmlsoap.org/soap/envelope/}Body/{urn:x}B"]
"#,
    );
    WssEngine::from_config(config).unwrap()
}

#[test]
fn test_e2e_policy_first_alternative_satisfied() {
    let engine = two_alternative_engine();
    let verified = engine
        .verify(&message(r#"<x:A xmlns:x="urn:x"/>"#))
        .unwrap();
    assert_eq!(verified.verdict, Some(PolicyVerdict::Satisfied { alternative: 0 }));
    assert!(verified.accepted);
}

#[test]
fn test_e2e_policy_violation_lists_each_alternative() {
    let engine = two_alternative_engine();
    let verified = engine.verify(&message(r#"<x:C xmlns:x="urn:x"/>"#)).unwrap();
    assert!(!verified.accepted);
    let violation = verified.verdict.unwrap().into_result().unwrap_err();
    assert_eq!(violation.unmet.len(), 2);
    assert!(violation.unmet[0].condition.ends_with("{urn:x}A missing"));
    assert!(violation.unmet[1].condition.ends_with("{urn:x}B missing"));
}

// ============================================================================
// Processor chain
// ============================================================================

struct PassThrough(UnitId);

impl ProcessingUnit for PassThrough {
    fn id(&self) -> UnitId {
        self.0
    }

    fn transform(&mut self, event: StreamEvent, _ctx: &mut UnitContext<'_>) -> Result<Vec<StreamEvent>, WssError> {
        Ok(vec![event])
    }
}

#[test]
fn test_e2e_ordering_conflict_leaves_chain_unchanged() {
    let mut chain = ProcessorChain::new();
    chain
        .insert(Box::new(PassThrough(UnitId::Timestamp)), Placement::new())
        .unwrap();
    chain
        .insert(
            Box::new(PassThrough(UnitId::Signature)),
            Placement::new().after(UnitId::Timestamp),
        )
        .unwrap();
    let before = chain.unit_ids();

    let result = chain.insert(
        Box::new(PassThrough(UnitId::Encrypt)),
        Placement::new().before(UnitId::Timestamp).after(UnitId::Signature),
    );
    assert!(matches!(result, Err(WssError::OrderingConflict(_))));
    assert_eq!(chain.unit_ids(), before);
}

#[test]
fn test_e2e_xxe_rejected() {
    let engine = engine("timestamp");
    let xml = r#"<?xml version="1.0"?><!DOCTYPE foo [<!ENTITY xxe SYSTEM "file:///etc/passwd">]><soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>&xxe;</soap:Body></soap:Envelope>"#;
    assert!(matches!(engine.secure(xml), Err(WssError::Structural(_))));
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_encrypt_decrypt_round_trip(items in proptest::collection::vec("[A-Za-z0-9 .,:;!?-]{1,40}", 1..4)) {
        let engine = engine("encrypt");
        let body: String = items.iter().map(|item| order(item)).collect();
        let original = message(&body);
        let secured = engine.secure(&original).unwrap();
        let verified = engine.verify(&secured.xml).unwrap();
        prop_assert_eq!(body_of(&verified.xml), body_of(&original));
    }

    #[test]
    fn prop_signed_messages_verify(item in "[A-Za-z0-9]{1,40}") {
        let engine = engine("signature");
        let secured = engine.secure(&message(&order(&item))).unwrap();
        prop_assert!(engine.verify(&secured.xml).is_ok());

        let tampered = secured.xml.replace(&format!(">{}<", item), &format!(">{}x<", item));
        prop_assert!(matches!(
            engine.verify(&tampered),
            Err(WssError::SignatureVerificationFailed(_))
        ));
    }
}
