#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::escape::EscapeSequenceError;
    use crate::schema::{SchemaRegistry, VARIES};
    use crate::{
        encode, parse, parse_with_version, validate, BatchReader, DiscrepancyKind, Field,
        HL7Error, Message, ParseIssue, Parser, Segment, SegmentStatus,
    };

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    const ADT_MESSAGE: &str = r#"MSH|^~\&|SENDING_APP|SENDING_FACILITY|RECEIVING_APP|RECEIVING_FACILITY|20230401123000||ADT^A01|MSG00001|P|2.5
EVN|A01|20230401123000
PID|1||12345^^^MRN||DOE^JOHN^^^^||19800101|M||W|123 MAIN ST^^ANYTOWN^CA^12345||5551234|||||12345678
NK1|1|DOE^JANE^^^^|SPOUSE|555-5678
PV1|1|I|2000^2012^01||||004777^ATTEND^AARON^A|||SUR||||ADM|A0|"#;

    const ORU_MESSAGE: &str = r#"MSH|^~\&|LAB|FACILITY|EHR|FACILITY|20230401123000||ORU^R01|MSG00002|P|2.5
PID|1||12345^^^MRN||DOE^JOHN^^^^||19800101|M
OBR|1||LAB123456|CBC^COMPLETE BLOOD COUNT^L|||20230401120000
OBX|1|NM|WBC^LEUKOCYTES^L||10.5|10*3/uL|4.0-11.0|N|||F
OBX|2|NM|RBC^ERYTHROCYTES^L||4.5|10*6/uL|4.5-5.9|N|||F"#;

    const RDE_MESSAGE: &str = r#"MSH|^~\&|PHARMACY|FACILITY|EHR|FACILITY|20230401123000||RDE^O11|MSG00003|P|2.5
PID|1||12345^^^MRN||DOE^JOHN^^^^||19800101|M
ORC|NW|ORD12345|||||||20230401123000|||
RXE|509^MEDROL|2|4MG||TAB|BID||509^MEDROL|10|||||||||||20230401|20230407
RXR|PO|ORAL|SWALLOW
RXE|123^AMOXICILLIN|3|500MG||CAP|TID||123^AMOXICILLIN|21|||||||||||20230401|20230408
RXR|PO|ORAL|SWALLOW"#;

    fn segment_codes(message: &Message) -> Vec<&str> {
        message.segments.iter().map(|s| s.code.as_str()).collect()
    }

    fn defined_fields(segment: &Segment) -> usize {
        match segment.status {
            SegmentStatus::Mapped { defined_fields } => defined_fields,
            SegmentStatus::Unmapped => 0,
        }
    }

    #[test]
    fn test_parse_adt_message() {
        init_logging();
        let parsed = parse(ADT_MESSAGE).unwrap();
        let message = &parsed.message;

        assert!(parsed.issues.is_empty(), "issues: {:?}", parsed.issues);
        assert_eq!(message.version, "2.5");
        assert_eq!(message.message_type().as_deref(), Some("ADT^A01"));
        assert_eq!(message.control_id(), Some("MSG00001"));
        assert_eq!(segment_codes(message), vec!["MSH", "EVN", "PID", "NK1", "PV1"]);

        assert_eq!(message.get("PID-3"), Some("12345"));
        assert_eq!(message.get("PID-3-4"), Some("MRN"));
        assert_eq!(message.get("PID-5-1"), Some("DOE"));
        assert_eq!(message.get("PID-5-2"), Some("JOHN"));
        assert_eq!(message.get("PID-7"), Some("19800101"));
        assert_eq!(message.get("PID-8"), Some("M"));
        assert_eq!(message.get("PID-11-3"), Some("ANYTOWN"));
        assert_eq!(message.get("PV1-7-2"), Some("ATTEND"));
        assert_eq!(message.get("EVN-1"), Some("A01"));
    }

    #[test]
    fn test_parse_oru_message() {
        init_logging();
        let parsed = parse(ORU_MESSAGE).unwrap();
        let message = &parsed.message;

        assert!(parsed.issues.is_empty());
        assert_eq!(message.message_type().as_deref(), Some("ORU^R01"));
        assert_eq!(message.segments_named("OBX").count(), 2);

        assert_eq!(message.get("OBR-4-2"), Some("COMPLETE BLOOD COUNT"));
        assert_eq!(message.get("OBX-3-1"), Some("WBC"));
        assert_eq!(message.get("OBX-3-2"), Some("LEUKOCYTES"));
        assert_eq!(message.get("OBX-5"), Some("10.5"));
        assert_eq!(message.get("OBX-6"), Some("10*3/uL"));
        assert_eq!(message.get("OBX-7"), Some("4.0-11.0"));
        assert_eq!(message.get("OBX[2]-3-1"), Some("RBC"));
        assert_eq!(message.get("OBX[2]-5"), Some("4.5"));

        // OBX-5 takes its datatype from OBX-2
        let obx = message.segment("OBX").unwrap();
        assert_eq!(obx.field(5).unwrap().datatype, "NM");
    }

    #[test]
    fn test_parse_rde_message() {
        init_logging();
        let parsed = parse(RDE_MESSAGE).unwrap();
        let message = &parsed.message;

        assert_eq!(message.message_type().as_deref(), Some("RDE^O11"));
        assert_eq!(message.get("ORC-1"), Some("NW"));
        assert_eq!(message.get("ORC-2"), Some("ORD12345"));
        assert_eq!(message.get("RXR[2]-3"), Some("SWALLOW"));

        // RXE is not in the built-in dictionaries
        assert_eq!(
            parsed.issues,
            vec![
                ParseIssue::UnknownSegment { index: 3, code: "RXE".to_string() },
                ParseIssue::UnknownSegment { index: 5, code: "RXE".to_string() },
            ]
        );
        let rxe: Vec<&Segment> = message.segments_named("RXE").collect();
        assert_eq!(rxe.len(), 2);
        assert_eq!(rxe[0].status, SegmentStatus::Unmapped);
        assert_eq!(message.get("RXE-1-2"), Some("MEDROL"));
        assert_eq!(message.get("RXE[2]-3"), Some("500MG"));
        assert_eq!(message.get("RXE[2]-21"), Some("20230408"));
    }

    #[test]
    fn test_pid_layout_v26() {
        let raw = "MSH|^~\\&|A|B|C|D|20230401||ADT^A01|1|P|2.6\rPID|1||12345^^^MRN||Doe^John||19800101|M";
        let message = parse(raw).unwrap().message;
        let pid = message.segment("PID").unwrap();

        let set_id = pid.field(1).unwrap();
        assert_eq!(set_id.datatype, "SI");
        assert_eq!(set_id.value(), "1");

        let identifier = pid.field(3).unwrap();
        assert_eq!(identifier.datatype, "CX");
        let cx = &identifier.repetitions[0].components;
        assert_eq!(cx.len(), 4);
        assert_eq!(cx[0].value(), "12345");
        assert_eq!(cx[3].value(), "MRN");

        let name = pid.field(5).unwrap();
        assert_eq!(name.datatype, "XPN");
        let xpn = &name.repetitions[0].components;
        assert_eq!(xpn.len(), 2);
        assert_eq!(xpn[0].value(), "Doe");
        assert_eq!(xpn[1].value(), "John");

        let birth = pid.field(7).unwrap();
        assert_eq!(birth.datatype, "DTM");
        assert_eq!(birth.value(), "19800101");

        let sex = pid.field(8).unwrap();
        assert_eq!(sex.datatype, "IS");
        assert_eq!(sex.value(), "M");

        let schema = SchemaRegistry::builtin().version("2.6").unwrap();
        assert!(validate(&message, &schema).is_empty());
    }

    #[test]
    fn test_field_count_invariant() {
        let registry = SchemaRegistry::builtin();
        for raw in [ADT_MESSAGE, ORU_MESSAGE, RDE_MESSAGE] {
            let message = parse(raw).unwrap().message;
            let schema = registry.version(&message.version).unwrap();
            let lines: Vec<&str> = raw.lines().collect();

            for (segment, line) in message.segments.iter().zip(lines) {
                let Ok(definition) = schema.lookup_segment(&segment.code) else {
                    continue;
                };
                let raw_tokens = line.split('|').count() - 1;
                assert_eq!(
                    segment.fields.len(),
                    raw_tokens.max(definition.fields.len()),
                    "{}",
                    segment.code
                );
                assert_eq!(defined_fields(segment), definition.fields.len());
            }
        }
    }

    #[test]
    fn test_idempotent_reparse() {
        init_logging();
        for raw in [ADT_MESSAGE, ORU_MESSAGE, RDE_MESSAGE] {
            let first = parse(raw).unwrap().message;
            let encoded = encode(&first);
            let second = parse(&encoded).unwrap().message;
            assert_eq!(first, second);
            assert_eq!(encode(&second), encoded);
        }
    }

    #[test]
    fn test_idempotent_reparse_with_escapes() {
        let raw = "MSH|^~\\&|APP|||||||1|P|2.5\r\
NTE|1||Pipe \\F\\ caret \\S\\ amp \\T\\ tilde \\R\\ slash \\E\\ hex \\X41\\ \\H\\bold\\N\\ bad \\Q\\ lone C:\\temp";
        let parsed = parse(raw).unwrap();
        assert_eq!(
            parsed.message.get("NTE-3"),
            Some("Pipe | caret ^ amp & tilde ~ slash \\ hex A \\H\\bold\\N\\ bad \\Q\\ lone C:\\temp")
        );
        assert_eq!(
            parsed
                .issues
                .iter()
                .filter(|i| matches!(i, ParseIssue::EscapeSequence { .. }))
                .count(),
            2
        );

        let again = parse(&encode(&parsed.message)).unwrap();
        assert_eq!(again.message, parsed.message);
        assert!(again.issues.is_empty());
    }

    #[test]
    fn test_round_trip_with_reserved_characters() {
        let mut message = parse(ADT_MESSAGE).unwrap().message;
        let samples = ["O|Brien", "A^B", "x&y", "1~2", "back\\slash", "\\H\\bold\\N\\", "plain"];
        let mut n = 0;
        for segment in message.segments.iter_mut().filter(|s| s.code != "MSH") {
            for field in segment.fields.iter_mut() {
                for repetition in field.repetitions.iter_mut() {
                    for component in repetition.components.iter_mut() {
                        for leaf in component.subcomponents.iter_mut().filter(|l| !l.is_empty()) {
                            leaf.push_str(samples[n % samples.len()]);
                            n += 1;
                        }
                    }
                }
            }
        }

        let encoded = encode(&message);
        assert!(encoded.contains("O\\F\\Brien"));
        let reparsed = parse(&encoded).unwrap();
        assert!(reparsed.issues.is_empty());
        assert_eq!(reparsed.message, message);
    }

    #[test]
    fn test_mutate_and_encode() {
        let mut message = parse(ADT_MESSAGE).unwrap().message;
        let pid = message
            .segments
            .iter_mut()
            .find(|s| s.code == "PID")
            .unwrap();
        *pid.field_mut(8).unwrap() = Field::new("IS", "F");
        *pid.field_mut(19).unwrap() = Field::new("ST", "999-99-9999");

        let encoded = encode(&message);
        let reparsed = parse(&encoded).unwrap().message;
        assert_eq!(reparsed.get("PID-8"), Some("F"));
        assert_eq!(reparsed.get("PID-19"), Some("999-99-9999"));
    }

    #[test]
    fn test_cardinality_boundary() {
        let raw = ADT_MESSAGE.replace("19800101|M|", "19800101|M~F|");
        let parsed = parse(&raw).unwrap();
        let schema = SchemaRegistry::builtin().version("2.5").unwrap();
        let found: Vec<_> = validate(&parsed.message, &schema)
            .into_iter()
            .filter(|d| d.kind == DiscrepancyKind::CardinalityExceeded)
            .collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].to_string(), "PID-8: too many repetitions ('M~F')");
    }

    #[test]
    fn test_length_boundary() {
        let schema = SchemaRegistry::builtin().version("2.5").unwrap();
        let max = schema.lookup_segment("PID").unwrap().field(1).unwrap().max_length().unwrap();

        let at_limit = ADT_MESSAGE.replace("PID|1|", &format!("PID|{}|", "9".repeat(max)));
        let message = parse(&at_limit).unwrap().message;
        assert!(validate(&message, &schema)
            .iter()
            .all(|d| d.kind != DiscrepancyKind::LengthExceeded));

        let over = ADT_MESSAGE.replace("PID|1|", &format!("PID|{}|", "9".repeat(max + 1)));
        let message = parse(&over).unwrap().message;
        let found: Vec<_> = validate(&message, &schema)
            .into_iter()
            .filter(|d| d.kind == DiscrepancyKind::LengthExceeded)
            .collect();
        assert_eq!(found.len(), 1);
        assert_eq!((found[0].segment.as_str(), found[0].field), ("PID", 1));
    }

    #[test]
    fn test_unknown_segment_tolerance() {
        let raw = ADT_MESSAGE.replacen("\nPID|", "\nZZZ|foo|bar\nPID|", 1);
        let with_zzz = parse(&raw).unwrap();
        let without = parse(ADT_MESSAGE).unwrap();

        assert_eq!(
            with_zzz.issues,
            vec![ParseIssue::UnknownSegment { index: 2, code: "ZZZ".to_string() }]
        );
        let zzz = with_zzz.message.segment("ZZZ").unwrap();
        assert_eq!(zzz.status, SegmentStatus::Unmapped);
        assert!(zzz.fields.iter().all(|f| f.datatype == VARIES));
        assert_eq!(zzz.value(2), "bar");

        let others: Vec<&Segment> = with_zzz
            .message
            .segments
            .iter()
            .filter(|s| s.code != "ZZZ")
            .collect();
        let expected: Vec<&Segment> = without.message.segments.iter().collect();
        assert_eq!(others, expected);
    }

    #[test]
    fn test_custom_delimiters() {
        let raw = "MSH#$*@!#APP#FAC#####ADT$A01#9#P#2.5\rPID#1##123$$$MRN*456##DOE$JOHN!JR";
        let parsed = parse(raw).unwrap();
        let message = &parsed.message;
        assert_eq!(message.delimiters.field, '#');
        assert_eq!(message.get("MSH-1"), Some("#"));
        assert_eq!(message.get("MSH-2"), Some("$*@!"));
        assert_eq!(message.get("PID-3-4"), Some("MRN"));
        assert_eq!(message.get("PID-3(2)"), Some("456"));
        assert_eq!(message.get("PID-5-2-2"), Some("JR"));

        let encoded = encode(message);
        assert!(encoded.starts_with("MSH#$*@!#APP#"));
        assert_eq!(parse(&encoded).unwrap().message, *message);
    }

    #[test]
    fn test_forced_version_and_errors() {
        let parsed = parse_with_version(ADT_MESSAGE, "2.6").unwrap();
        assert_eq!(parsed.message.version, "2.6");
        assert_eq!(parsed.message.get("MSH-12"), Some("2.5"));

        assert!(matches!(
            parse_with_version(ADT_MESSAGE, "3.0"),
            Err(HL7Error::UnknownVersion(_))
        ));
        assert!(matches!(parse(""), Err(HL7Error::MalformedHeader(_))));
        assert!(matches!(parse("PID1"), Err(HL7Error::MalformedHeader(_))));
    }

    #[test]
    fn test_message_serializes() {
        let message = parse(ORU_MESSAGE).unwrap().message;
        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_lone_escape_before_delimiter() {
        init_logging();
        let raw = "MSH|^~\\&|APP|||||||1|P|2.5\rNTE|1|L|A\\|next\r";
        let parsed = parse(raw).unwrap();
        let message = &parsed.message;
        assert_eq!(message.get("NTE-3"), Some("A\\"));
        assert_eq!(message.get("NTE-4"), Some("next"));
        assert!(parsed.issues.iter().any(|issue| matches!(
            issue,
            ParseIssue::EscapeSequence {
                field: 3,
                error: EscapeSequenceError::Unterminated(_),
                ..
            }
        )));

        let encoded = encode(message);
        assert!(encoded.contains("NTE|1|L|A\\E\\|next"));
        let reparsed = parse(&encoded).unwrap();
        assert!(reparsed.issues.is_empty());
        assert_eq!(reparsed.message, *message);
    }

    #[test]
    fn test_batch_file_with_two_batches() {
        init_logging();
        let raw = format!(
            "FHS|^~\\&|HUB\rBHS|^~\\&|HUB\r{}\rBTS|1\rBHS|^~\\&|HUB\r{}\r{}\rBTS|2\rFTS|2\r",
            ADT_MESSAGE, ORU_MESSAGE, RDE_MESSAGE
        );
        let parser = Parser::default();
        let reader = BatchReader::new(&parser, &raw).unwrap();
        assert_eq!(reader.batches().len(), 2);
        assert!(reader.count_matches());

        let messages: Vec<Message> = reader.map(|r| r.unwrap().message).collect();
        let expected: Vec<Message> = [ADT_MESSAGE, ORU_MESSAGE, RDE_MESSAGE]
            .iter()
            .map(|raw| parse(raw).unwrap().message)
            .collect();
        assert_eq!(messages, expected);
    }

    #[test]
    fn test_concurrent_parses_share_registry() {
        let parser = Parser::default();
        assert!(Arc::ptr_eq(parser.registry(), &SchemaRegistry::builtin()));
        let expected = parser.parse(ORU_MESSAGE).unwrap().message;
        let schema = parser.registry().version("2.5").unwrap();
        let expected_issues = validate(&expected, &schema);

        std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let message = parser.parse(ORU_MESSAGE).unwrap().message;
                        let issues = validate(&message, &schema);
                        (message, issues)
                    })
                })
                .collect();
            for worker in workers {
                let (message, issues) = worker.join().unwrap();
                assert_eq!(message, expected);
                assert_eq!(issues, expected_issues);
            }
        });
    }
}
