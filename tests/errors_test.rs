#[cfg(test)]
mod error_tests {
    use camfusion::errors::{ErrorKind, ProcessorError};
    use camfusion::{FrameBuffer, PixelFormat};
    use std::error::Error;

    #[test]
    fn test_empty_input_display() {
        assert_eq!(
            ProcessorError::EmptyInput.to_string(),
            "No input frames provided"
        );
    }

    #[test]
    fn test_format_mismatch_display() {
        let error = ProcessorError::FormatMismatch {
            expected: PixelFormat::Rgb8,
            got: PixelFormat::Rgba8,
        };
        assert_eq!(
            error.to_string(),
            "Pixel format mismatch: expected Rgb8, got Rgba8"
        );
    }

    #[test]
    fn test_data_corruption_display() {
        let error = ProcessorError::DataCorruption {
            frame_size: 100,
            expected_size: 300,
        };
        assert!(error.to_string().contains("got 100 bytes, expected 300"));
    }

    #[test]
    fn test_message_variants_keep_their_text() {
        let error = ProcessorError::invalid_config("levels must be between 2 and 4");
        assert_eq!(
            error.to_string(),
            "Invalid config: levels must be between 2 and 4"
        );

        match ProcessorError::consumed("accumulator") {
            ProcessorError::StateConsumed(what) => assert_eq!(what, "accumulator"),
            other => panic!("Wrong error variant: {:?}", other),
        }
    }

    #[test]
    fn test_every_precondition_maps_to_one_kind() {
        let errors = vec![
            ProcessorError::EmptyInput,
            ProcessorError::InsufficientFrames {
                required: 2,
                provided: 1,
            },
            ProcessorError::DimensionMismatch {
                expected: (4, 4),
                got: (2, 2),
            },
            ProcessorError::FormatMismatch {
                expected: PixelFormat::Rgb8,
                got: PixelFormat::Rgba8,
            },
            ProcessorError::DataCorruption {
                frame_size: 1,
                expected_size: 3,
            },
            ProcessorError::invalid_config("bad"),
            ProcessorError::consumed("state"),
        ];

        for error in errors {
            assert_eq!(error.kind(), ErrorKind::PreconditionViolation, "{}", error);
            assert!(!error.to_string().is_empty());
        }

        let oom = ProcessorError::AllocationFailed {
            bytes: 1 << 40,
            purpose: "radiance buffer",
        };
        assert_eq!(oom.kind(), ErrorKind::AllocationFailure);
        assert!(oom.to_string().contains("radiance buffer"));
    }

    #[test]
    fn test_implements_error_trait() {
        let error = ProcessorError::EmptyInput;
        let as_trait: &dyn Error = &error;
        assert!(as_trait.source().is_none());
    }

    #[test]
    fn test_converts_into_anyhow() {
        fn fails() -> anyhow::Result<()> {
            Err(ProcessorError::EmptyInput)?;
            Ok(())
        }
        let error = fails().unwrap_err();
        assert!(error.downcast_ref::<ProcessorError>().is_some());
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::AllocationFailure).unwrap();
        assert_eq!(json, "\"AllocationFailure\"");
    }

    #[test]
    fn test_truncated_buffer_is_data_corruption() {
        let result = FrameBuffer::try_new(vec![0; 11], 2, 2, PixelFormat::Rgb8);
        assert_eq!(
            result.unwrap_err(),
            ProcessorError::DataCorruption {
                frame_size: 11,
                expected_size: 12
            }
        );
    }

    #[test]
    fn test_empty_dimensions_are_invalid_config() {
        let result = FrameBuffer::try_new(Vec::new(), 0, 10, PixelFormat::Rgba8);
        assert!(matches!(result, Err(ProcessorError::InvalidConfig(_))));
    }
}
