//! Tests for error types and error body decoding.

use super::*;

mod protocol_error_decoding {
    use super::*;

    /// Verify the XML error document is decoded into code and detail.
    #[test]
    fn test_xml_error_body_is_decoded() {
        let body = br#"<Error><Code>401</Code><Detail>InvalidSignature: The token has an invalid signature.</Detail></Error>"#;

        let error = ProtocolError::from_response(401, body);

        assert_eq!(error.status, 401);
        assert_eq!(error.code, Some(401));
        assert_eq!(
            error.detail.as_deref(),
            Some("InvalidSignature: The token has an invalid signature.")
        );

        let message = error.to_string();
        assert!(message.contains("InvalidSignature"));
        assert!(message.contains("401"));
    }

    /// Verify XML with whitespace and a declaration still decodes.
    #[test]
    fn test_xml_error_body_with_declaration() {
        let body = br#"<?xml version="1.0" encoding="utf-8"?>
            <Error>
                <Code>404</Code>
                <Detail>The messaging entity 'stuff' could not be found.</Detail>
            </Error>"#;

        let error = ProtocolError::from_response(404, body);

        assert_eq!(error.code, Some(404));
        assert_eq!(
            error.to_string(),
            "The messaging entity 'stuff' could not be found. (Code: 404)"
        );
    }

    /// Verify the flat JSON error shape is decoded.
    #[test]
    fn test_flat_json_error_body_is_decoded() {
        let body = br#"{"Code": 410, "Detail": "The lock supplied is invalid."}"#;

        let error = ProtocolError::from_response(410, body);

        assert_eq!(error.code, Some(410));
        assert_eq!(error.detail.as_deref(), Some("The lock supplied is invalid."));
    }

    /// Verify the nested JSON error shape is decoded, with a string code.
    #[test]
    fn test_nested_json_error_body_is_decoded() {
        let body = br#"{"error": {"code": "400", "message": "Bad request."}}"#;

        let error = ProtocolError::from_response(400, body);

        assert_eq!(error.code, Some(400));
        assert_eq!(error.detail.as_deref(), Some("Bad request."));
        assert_eq!(error.to_string(), "Bad request. (Code: 400)");
    }

    /// Verify an empty body reports the raw status code.
    #[test]
    fn test_empty_body_reports_status_code() {
        let error = ProtocolError::from_response(503, b"");

        assert_eq!(error.code, None);
        assert_eq!(error.detail, None);
        assert_eq!(error.to_string(), "returned code: 503");
    }

    /// Verify an unparseable body is reported verbatim with the status code.
    #[test]
    fn test_unparseable_body_is_reported_raw() {
        let error = ProtocolError::from_response(500, b"upstream exploded");

        assert_eq!(error.code, None);
        let message = error.to_string();
        assert!(message.contains("upstream exploded"));
        assert!(message.contains("500"));
    }

    /// Verify an XML document that is not an error is not mistaken for one.
    #[test]
    fn test_unrelated_xml_is_reported_raw() {
        let error = ProtocolError::from_response(502, b"<html><body>Bad Gateway</body></html>");

        assert_eq!(error.code, None);
        assert!(error.to_string().contains("Bad Gateway"));
        assert!(error.to_string().contains("502"));
    }
}

mod classification {
    use super::*;

    /// Verify retry classification follows the status code.
    #[test]
    fn test_error_transience() {
        assert!(ServiceBusError::from(ProtocolError::from_response(503, b"")).is_transient());
        assert!(ServiceBusError::from(ProtocolError::from_response(429, b"")).is_transient());
        assert!(ServiceBusError::from(ProtocolError::from_response(408, b"")).is_transient());
        assert!(!ServiceBusError::from(ProtocolError::from_response(401, b"")).is_transient());
        assert!(!ServiceBusError::from(ProtocolError::from_response(410, b"")).is_transient());

        assert!(ServiceBusError::from(TransportError::Connection {
            message: "reset".to_string(),
        })
        .is_transient());

        assert!(!ServiceBusError::from(ConfigurationError::SubscriptionRequired).is_transient());
    }

    /// Verify the status accessor only reports service responses.
    #[test]
    fn test_status_accessor() {
        let protocol = ServiceBusError::from(ProtocolError::from_response(404, b""));
        assert_eq!(protocol.status(), Some(404));

        let config = ServiceBusError::from(ConfigurationError::SubscriptionRequired);
        assert_eq!(config.status(), None);
    }

    /// Verify the top-level message for a protocol error is the decoded message.
    #[test]
    fn test_protocol_error_display_passthrough() {
        let error = ServiceBusError::from(ProtocolError::from_response(
            401,
            b"<Error><Code>401</Code><Detail>Unauthorized</Detail></Error>",
        ));

        assert_eq!(error.to_string(), "Unauthorized (Code: 401)");
    }
}
