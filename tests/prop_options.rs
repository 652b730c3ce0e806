//! Property tests for transform option parsing and sanitizing

use assetgate::options::{parse_legacy, parse_query, LEGACY_SCHEMA};
use assetgate::TransformOptions;
use proptest::prelude::*;

fn any_options() -> impl Strategy<Value = TransformOptions> {
    (
        proptest::option::of(0u32..3000),
        proptest::option::of(0u32..3000),
        proptest::option::of(0u8..=100),
        proptest::option::of(prop_oneof![Just(0.0f32), 0.5f32..3.5]),
        proptest::option::of(any::<bool>()),
        proptest::option::of(prop_oneof![
            Just(String::new()),
            Just("0".to_string()),
            Just("none".to_string()),
            "[a-z]{3,4}",
        ]),
        proptest::option::of(0u32..500),
    )
        .prop_map(|(width, height, quality, dpr, trim, format, crop_x)| TransformOptions {
            width,
            height,
            quality,
            device_pixel_ratio: dpr,
            trim,
            format,
            crop_x,
            ..Default::default()
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Sanitizing twice is the same as sanitizing once
    #[test]
    fn prop_sanitize_idempotent(options in any_options()) {
        let mut once = options.clone();
        once.sanitize();
        let mut twice = once.clone();
        twice.sanitize();
        prop_assert_eq!(once, twice);
    }

    /// No zero or false value survives sanitizing
    #[test]
    fn prop_sanitize_drops_zero_values(options in any_options()) {
        let mut options = options;
        options.sanitize();
        prop_assert_ne!(options.width, Some(0));
        prop_assert_ne!(options.height, Some(0));
        prop_assert_ne!(options.quality, Some(0));
        prop_assert_ne!(options.trim, Some(false));
        prop_assert_ne!(options.device_pixel_ratio, Some(0.0));
        prop_assert!(options.format.as_deref().map_or(true, |f| !f.is_empty() && f != "0"));
    }

    /// Everything after the option segments is the asset path
    #[test]
    fn prop_legacy_path_follows_options(
        width in 0u32..2000,
        height in 0u32..2000,
        quality in 0u8..=100,
        path in proptest::collection::vec("[a-z0-9_-]{1,12}", 1..4),
    ) {
        let mut segments: Vec<String> = vec!["0".to_string(); LEGACY_SCHEMA.len()];
        segments[0] = "png".to_string();
        segments[1] = quality.to_string();
        segments[4] = width.to_string();
        segments[5] = height.to_string();
        let file = format!("{}.jpg", path.join("/"));
        segments.extend(file.split('/').map(str::to_string));

        let refs: Vec<&str> = segments.iter().map(String::as_str).collect();
        let (options, parsed_path) = parse_legacy(&refs).unwrap();

        prop_assert_eq!(parsed_path, file);
        prop_assert_eq!(options.format.as_deref(), Some("png"));
        prop_assert_eq!(options.width, (width > 0).then_some(width));
        prop_assert_eq!(options.height, (height > 0).then_some(height));
        prop_assert_eq!(options.quality, (quality > 0).then_some(quality));
    }

    /// Query and legacy syntax agree on the same values
    #[test]
    fn prop_query_matches_legacy(width in 1u32..2000, height in 1u32..2000) {
        let mut segments: Vec<String> = vec!["0".to_string(); LEGACY_SCHEMA.len()];
        segments[0] = "jpg".to_string();
        segments[4] = width.to_string();
        segments[5] = height.to_string();
        segments.push("photo.jpg".to_string());
        let refs: Vec<&str> = segments.iter().map(String::as_str).collect();
        let (legacy, _) = parse_legacy(&refs).unwrap();

        let pairs = vec![
            ("width".to_string(), width.to_string()),
            ("height".to_string(), height.to_string()),
        ];
        let query = parse_query(&pairs, Some("jpg")).unwrap();

        prop_assert_eq!(legacy.canonical(), query.canonical());
    }
}
