// Option fragments from several images merged into one context

mod test_utils;

use langctx::{ImageId, ImageInfo, MacroPolicy, OptionSanitizer, Target, TargetId};
use std::fs;
use std::sync::Arc;
use test_utils::{CountingFrontend, Workspace};

fn conflicting_images(ws: &Workspace) -> Vec<ImageInfo> {
    vec![
        ImageInfo::new(ImageId(1), ws.build_dir().join("app"))
            .with_options(["-DCONFLICT=1", "-warnings-as-errors", "-enable-testing"]),
        ImageInfo::new(ImageId(2), ws.build_dir().join("libDylib.so"))
            .with_options(["-D", "CONFLICT=2", "-Xcc", "-Werror", "-enable-testing"]),
    ]
}

#[test]
fn test_each_image_compiles_with_its_own_macro() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    ws.interface("Shared", "public func shared()")?;
    let frontend = Arc::new(CountingFrontend::default());
    let registry = ws.registry(Arc::clone(&frontend));
    let context = registry.get_context(&ws.target_with_images(1, conflicting_images(&ws)))?;

    let merged = context.options().render();
    assert!(!merged.iter().any(|o| o.contains("Werror") || o == "-warnings-as-errors"));
    assert_eq!(merged.iter().filter(|o| *o == "-enable-testing").count(), 1);

    let one = context.resolve_module_for_image("Shared", ImageId(1))?;
    let two = context.resolve_module_for_image("Shared", ImageId(2))?;
    assert_ne!(one, two);
    assert_eq!(frontend.compiles(), 2);

    let one_bytes = fs::read(&one)?;
    let two_bytes = fs::read(&two)?;
    let contains = |haystack: &[u8], needle: &str| {
        haystack
            .windows(needle.len())
            .any(|window| window == needle.as_bytes())
    };
    assert!(contains(&one_bytes, "-DCONFLICT=1"));
    assert!(!contains(&one_bytes, "CONFLICT=2"));
    assert!(contains(&two_bytes, "-DCONFLICT=2"));
    assert!(!contains(&two_bytes, "CONFLICT=1"));
    Ok(())
}

#[test]
fn test_configuration_log_shows_sanitized_options() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let registry = ws.registry(Arc::new(CountingFrontend::default()));
    registry.get_context(&ws.target_with_images(1, conflicting_images(&ws)))?;

    let log = registry.health_log();
    let options = log.lines_matching("Options: ");
    assert_eq!(options.len(), 1);
    assert!(options[0].contains("-enable-testing"));
    assert!(!options[0].contains("Werror"));
    assert_eq!(log.lines_matching("Macros of image#1: -DCONFLICT=1").len(), 1);
    assert_eq!(log.lines_matching("Macros of image#2: -DCONFLICT=2").len(), 1);
    Ok(())
}

#[test]
fn test_first_wins_policy_reports_conflict() {
    let target = Target::new(TargetId(1), "linux")
        .with_image(ImageInfo::new(ImageId(1), "/build/app").with_options(["-DCONFLICT=1"]))
        .with_image(ImageInfo::new(ImageId(2), "/build/lib.so").with_options(["-DCONFLICT=2"]));

    let set = OptionSanitizer::new(MacroPolicy::FirstWins).sanitize(&target.image_options());
    assert_eq!(set.conflicts().len(), 1);
    assert_eq!(set.conflicts()[0].winner, Some(ImageId(1)));
    assert_eq!(
        set.render_for_image(ImageId(2))
            .iter()
            .filter(|o| o.starts_with("-DCONFLICT"))
            .collect::<Vec<_>>(),
        vec!["-DCONFLICT=1"]
    );
}
