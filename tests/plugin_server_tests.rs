// Plugin worker discovery and macro expansion routing

mod test_utils;

use langctx::plugin_server::{PluginServerRegistry, PLUGIN_SERVER_NAME};
use langctx::{ContextRegistry, LangCtxError, MacroInvocation, PluginError, Target};
use serial_test::serial;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use test_utils::{CountingFrontend, Workspace};

/// A clang-based build tree: `<root>/llvm-linux/bin/clang` with the worker in
/// `<root>/swift-linux/bin`
fn clang_build_tree(ws: &Workspace) -> anyhow::Result<(PathBuf, PathBuf)> {
    let llvm_bin = ws.path().join("llvm-linux/bin");
    let swift_bin = ws.path().join("swift-linux/bin");
    fs::create_dir_all(&llvm_bin)?;
    fs::create_dir_all(&swift_bin)?;
    fs::write(llvm_bin.join("clang"), "")?;
    let worker = swift_bin.join(PLUGIN_SERVER_NAME);
    fs::write(&worker, "")?;
    Ok((llvm_bin.join("clang"), worker))
}

fn invocation(build_dir: &Path, source: &str) -> MacroInvocation {
    MacroInvocation {
        macro_name: "stringify".to_string(),
        module: "MacroLib".to_string(),
        build_dir: build_dir.to_path_buf(),
        source: source.to_string(),
        image: None,
    }
}

fn target_with_compiler(ws: &Workspace, compiler: &Path) -> Target {
    ws.target(1).with_compiler(compiler)
}

#[test]
fn test_expansion_routes_to_resolved_worker() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let (clang, worker) = clang_build_tree(&ws)?;
    let frontend = Arc::new(CountingFrontend::default());
    let plugins = Arc::new(PluginServerRegistry::default());
    let registry = ws
        .registry(Arc::clone(&frontend))
        .with_plugin_registry(Arc::clone(&plugins));
    let context = registry.get_context(&target_with_compiler(&ws, &clang))?;

    let expanded = context.expand_macro(&invocation(&ws.build_dir(), "#stringify(1 + 2)"))?;
    assert_eq!(expanded.plugin_server, worker);
    assert!(expanded.source.contains("#stringify(1 + 2)"));
    assert!(expanded.warnings.is_empty());

    // Registered for the build directory from now on
    assert_eq!(plugins.lookup(&ws.build_dir()), Some(worker.clone()));
    assert_eq!(
        plugins.render_options(),
        vec![
            "-external-plugin-path".to_string(),
            format!("{}#{}", ws.build_dir().display(), worker.display()),
        ]
    );
    assert_eq!(frontend.expansions(), 1);
    Ok(())
}

#[test]
fn test_missing_worker_lists_attempted_paths() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let clang = ws.path().join("llvm-linux/bin/clang");
    let registry = ws.registry(Arc::new(CountingFrontend::default()));
    let context = registry.get_context(&target_with_compiler(&ws, &clang))?;

    let error = context
        .expand_macro(&invocation(&ws.build_dir(), "#stringify(1)"))
        .unwrap_err();
    match &error {
        LangCtxError::Plugin(inner) => match inner.as_ref() {
            PluginError::NotFound { attempted, .. } => {
                assert_eq!(attempted[0], ws.path().join("llvm-linux/bin").join(PLUGIN_SERVER_NAME));
                assert_eq!(attempted[1], ws.path().join("swift-linux/bin").join(PLUGIN_SERVER_NAME));
            }
            other => panic!("unexpected error: {other:?}"),
        },
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(error.exit_code(), langctx::exit_codes::PLUGIN_ERROR);

    // Module imports are unaffected
    ws.interface("A", "public func a()")?;
    assert!(context.resolve_module("A").is_ok());
    Ok(())
}

#[test]
fn test_failed_expansion_is_a_macro_error() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let (clang, _worker) = clang_build_tree(&ws)?;
    let registry = ws.registry(Arc::new(CountingFrontend::default()));
    let context = registry.get_context(&target_with_compiler(&ws, &clang))?;

    let error = context
        .expand_macro(&invocation(&ws.build_dir(), "#error"))
        .unwrap_err();
    let bridged = error.to_evaluator_error();
    assert_eq!(bridged.tag(), "MACRO_EXPANSION_FAILURE");
    Ok(())
}

#[test]
fn test_override_bypasses_resolution() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let custom = ws.path().join("custom-worker");
    let mut settings = ws.settings();
    settings
        .plugin_server_override
        .insert(ws.build_dir(), custom.clone());
    let registry = ContextRegistry::new(settings)
        .with_frontend(Arc::new(CountingFrontend::default()))
        .with_plugin_registry(Arc::new(PluginServerRegistry::default()));
    let context = registry.get_context(&ws.target(1))?;

    let expanded = context.expand_macro(&invocation(&ws.build_dir(), "#stringify(x)"))?;
    assert_eq!(expanded.plugin_server, custom);

    let log = registry.health_log();
    let expected = format!("-external-plugin-path {}#{}", ws.build_dir().display(), custom.display());
    assert_eq!(log.lines_matching(&expected).len(), 1);
    Ok(())
}

#[test]
#[serial]
fn test_process_wide_registry_shared_across_contexts() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let (clang, worker) = clang_build_tree(&ws)?;
    let global = PluginServerRegistry::global();
    global.clear();

    let first = ContextRegistry::new(ws.settings()).with_frontend(Arc::new(CountingFrontend::default()));
    let second = ContextRegistry::new(ws.settings()).with_frontend(Arc::new(CountingFrontend::default()));
    let one = first.get_context(&target_with_compiler(&ws, &clang))?;
    one.expand_macro(&invocation(&ws.build_dir(), "#stringify(1)"))?;

    // No worker sits next to the second context's compiler; the mapping
    // registered through the first registry is used instead.
    let two = second.get_context(&ws.target(2))?;
    assert_eq!(global.lookup(&ws.build_dir()), Some(worker.clone()));
    let expanded = two.expand_macro(&invocation(&ws.build_dir(), "#stringify(2)"))?;
    assert_eq!(expanded.plugin_server, worker);

    global.clear();
    Ok(())
}

#[test]
fn test_override_wins_over_worker_registered_earlier() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let (clang, worker) = clang_build_tree(&ws)?;
    let plugins = Arc::new(PluginServerRegistry::default());
    let registry = ws
        .registry(Arc::new(CountingFrontend::default()))
        .with_plugin_registry(Arc::clone(&plugins));

    let plain = registry.get_context(&target_with_compiler(&ws, &clang))?;
    let expanded = plain.expand_macro(&invocation(&ws.build_dir(), "#stringify(1)"))?;
    assert_eq!(expanded.plugin_server, worker);

    let custom = ws.path().join("custom-worker");
    let mut settings = registry.settings();
    settings
        .plugin_server_override
        .insert(ws.build_dir(), custom.clone());
    registry.update_settings(settings)?;

    let overridden = registry.get_context(&ws.target(2).with_compiler(&clang))?;
    let expanded = overridden.expand_macro(&invocation(&ws.build_dir(), "#stringify(2)"))?;
    assert_eq!(expanded.plugin_server, custom);

    // The first context keeps routing to the worker it resolved
    let expanded = plain.expand_macro(&invocation(&ws.build_dir(), "#stringify(3)"))?;
    assert_eq!(expanded.plugin_server, worker);
    assert_eq!(plugins.lookup(&ws.build_dir()), Some(worker));
    Ok(())
}

#[test]
fn test_overrides_stay_with_their_context() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let plugins = Arc::new(PluginServerRegistry::default());
    let first_worker = ws.path().join("first-worker");
    let second_worker = ws.path().join("second-worker");

    let mut first_settings = ws.settings();
    first_settings
        .plugin_server_override
        .insert(ws.build_dir(), first_worker.clone());
    let first = ContextRegistry::new(first_settings)
        .with_frontend(Arc::new(CountingFrontend::default()))
        .with_plugin_registry(Arc::clone(&plugins));

    let mut second_settings = ws.settings();
    second_settings
        .plugin_server_override
        .insert(ws.build_dir(), second_worker.clone());
    let second = ContextRegistry::new(second_settings)
        .with_frontend(Arc::new(CountingFrontend::default()))
        .with_plugin_registry(Arc::clone(&plugins));

    let one = first.get_context(&ws.target(1))?;
    let two = second.get_context(&ws.target(2))?;
    assert_eq!(
        one.expand_macro(&invocation(&ws.build_dir(), "#stringify(1)"))?.plugin_server,
        first_worker
    );
    assert_eq!(
        two.expand_macro(&invocation(&ws.build_dir(), "#stringify(2)"))?.plugin_server,
        second_worker
    );
    assert!(plugins.entries().is_empty());
    Ok(())
}
