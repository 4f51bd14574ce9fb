// Sanitizing and merging frontend options collected from compiled images
//
// Every image carries the options it was built with. Merging them naively
// breaks expression evaluation: one image built with warnings-as-errors turns
// every warning in the debugger into an error, and two images defining the same
// macro differently cannot share one global definition.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

use crate::target::ImageId;

/// Flags whose value may be given as the following token
pub const VALUE_FLAGS: &[&str] = &[
    "-I",
    "-F",
    "-L",
    "-Xcc",
    "-ivfsoverlay",
    "-module-cache-path",
    "-sdk",
    "-target",
    "-external-plugin-path",
    "-load-plugin-library",
];

/// Search path flags that also accept the value glued on (`-I/path`)
const ATTACHED_FLAGS: &[&str] = &["-I", "-F", "-L"];

const WARNINGS_AS_ERRORS: &[&str] = &["-Werror", "-warnings-as-errors"];

/// The option fragment of one compiled image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageOptions {
    pub image: ImageId,
    pub args: Vec<String>,
}

impl ImageOptions {
    pub fn new(image: ImageId, args: Vec<String>) -> Self {
        Self { image, args }
    }
}

/// How conflicting macro definitions from different images are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum MacroPolicy {
    /// Every image keeps its own definitions for its own compilations
    #[default]
    PartitionPerImage,
    /// The first image to define a macro wins for every image
    FirstWins,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum MacroDirective {
    Define { name: String, value: Option<String> },
    Undefine { name: String },
}

impl MacroDirective {
    fn parse(flag: &str, body: &str) -> Option<Self> {
        if body.is_empty() {
            return None;
        }
        if flag == "-U" {
            return Some(MacroDirective::Undefine {
                name: body.to_string(),
            });
        }
        Some(match body.split_once('=') {
            Some((name, value)) => MacroDirective::Define {
                name: name.to_string(),
                value: Some(value.to_string()),
            },
            None => MacroDirective::Define {
                name: body.to_string(),
                value: None,
            },
        })
    }

    pub fn name(&self) -> &str {
        match self {
            MacroDirective::Define { name, .. } | MacroDirective::Undefine { name } => name,
        }
    }
}

impl fmt::Display for MacroDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacroDirective::Define { name, value: Some(value) } => write!(f, "-D{name}={value}"),
            MacroDirective::Define { name, value: None } => write!(f, "-D{name}"),
            MacroDirective::Undefine { name } => write!(f, "-U{name}"),
        }
    }
}

/// A macro directive and whether it was passed through to the clang importer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MacroDefinition {
    pub directive: MacroDirective,
    pub clang: bool,
}

impl MacroDefinition {
    fn render_into(&self, out: &mut Vec<String>) {
        if self.clang {
            out.push("-Xcc".to_string());
        }
        out.push(self.directive.to_string());
    }
}

/// Images that disagree on one macro
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MacroConflict {
    pub name: String,
    pub definitions: Vec<(ImageId, MacroDirective)>,
    /// Set under `MacroPolicy::FirstWins`
    pub winner: Option<ImageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
enum ValueStyle {
    Separate,
    Equals,
}

/// One merged, non-macro option
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SanitizedOption {
    pub key: String,
    pub value: Option<String>,
    pub clang: bool,
    #[serde(skip)]
    style: ValueStyle,
}

impl SanitizedOption {
    fn render_into(&self, out: &mut Vec<String>) {
        let mut tokens = Vec::with_capacity(2);
        match (&self.value, self.style) {
            (None, _) => tokens.push(self.key.clone()),
            (Some(value), ValueStyle::Separate) => {
                tokens.push(self.key.clone());
                tokens.push(value.clone());
            }
            (Some(value), ValueStyle::Equals) => tokens.push(format!("{}={}", self.key, value)),
        }
        for token in tokens {
            if self.clang {
                out.push("-Xcc".to_string());
            }
            out.push(token);
        }
    }
}

/// The merged option set of one language context. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SanitizedOptionSet {
    options: Vec<SanitizedOption>,
    suppressed: BTreeSet<String>,
    global_macros: Vec<MacroDefinition>,
    image_macros: BTreeMap<ImageId, Vec<MacroDefinition>>,
    conflicts: Vec<MacroConflict>,
    include_paths: Vec<PathBuf>,
    framework_paths: Vec<PathBuf>,
    library_paths: Vec<PathBuf>,
    vfs_overlays: Vec<PathBuf>,
    policy: MacroPolicy,
}

impl SanitizedOptionSet {
    pub fn options(&self) -> &[SanitizedOption] {
        &self.options
    }

    /// Value of the first option with this key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|option| option.key == key)
            .and_then(|option| option.value.as_deref())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.options.iter().any(|option| option.key == key)
    }

    /// Keys dropped because they must never apply globally
    pub fn suppressed(&self) -> &BTreeSet<String> {
        &self.suppressed
    }

    pub fn is_suppressed(&self, key: &str) -> bool {
        self.suppressed.contains(key)
    }

    pub fn macros_for_image(&self, image: ImageId) -> &[MacroDefinition] {
        self.image_macros
            .get(&image)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn global_macros(&self) -> &[MacroDefinition] {
        &self.global_macros
    }

    pub fn image_macros(&self) -> &BTreeMap<ImageId, Vec<MacroDefinition>> {
        &self.image_macros
    }

    pub fn conflicts(&self) -> &[MacroConflict] {
        &self.conflicts
    }

    pub fn policy(&self) -> MacroPolicy {
        self.policy
    }

    /// Module search paths from `-I`, in first-seen order
    pub fn include_paths(&self) -> &[PathBuf] {
        &self.include_paths
    }

    pub fn framework_paths(&self) -> &[PathBuf] {
        &self.framework_paths
    }

    pub fn library_paths(&self) -> &[PathBuf] {
        &self.library_paths
    }

    pub fn vfs_overlays(&self) -> &[PathBuf] {
        &self.vfs_overlays
    }

    /// Global options as a command line
    pub fn render(&self) -> Vec<String> {
        let mut out = Vec::new();
        for option in &self.options {
            option.render_into(&mut out);
        }
        for definition in &self.global_macros {
            definition.render_into(&mut out);
        }
        out
    }

    /// Global options plus the macros scoped to `image`
    pub fn render_for_image(&self, image: ImageId) -> Vec<String> {
        let mut out = self.render();
        for definition in self.macros_for_image(image) {
            definition.render_into(&mut out);
        }
        out
    }

    pub fn render_line(&self) -> String {
        self.render().join(" ")
    }
}

/// A token classified by the option grammar
enum Parsed {
    Suppressed(String),
    Macro(MacroDirective),
    Option {
        key: String,
        value: Option<String>,
        style: ValueStyle,
    },
}

/// Merges per-image option fragments into one `SanitizedOptionSet`
#[derive(Debug, Clone, Default)]
pub struct OptionSanitizer {
    policy: MacroPolicy,
}

impl OptionSanitizer {
    pub fn new(policy: MacroPolicy) -> Self {
        Self { policy }
    }

    pub fn sanitize(&self, fragments: &[ImageOptions]) -> SanitizedOptionSet {
        let mut set = SanitizedOptionSet {
            policy: self.policy,
            ..SanitizedOptionSet::default()
        };
        let mut seen_options = BTreeSet::new();
        // name -> (image, definition) in input order
        let mut macro_sources: BTreeMap<String, Vec<(ImageId, MacroDefinition)>> = BTreeMap::new();

        for fragment in fragments {
            for (parsed, clang) in tokenize(&fragment.args) {
                match parsed {
                    Parsed::Suppressed(key) => {
                        debug!(image = %fragment.image, option = %key, "Dropping option");
                        set.suppressed.insert(key);
                    }
                    Parsed::Macro(directive) => {
                        let definition = MacroDefinition { directive, clang };
                        let entries = macro_sources
                            .entry(definition.directive.name().to_string())
                            .or_default();
                        if !entries
                            .iter()
                            .any(|(image, existing)| *image == fragment.image && *existing == definition)
                        {
                            entries.push((fragment.image, definition));
                        }
                    }
                    Parsed::Option { key, value, style } => {
                        let option = SanitizedOption {
                            key,
                            value,
                            clang,
                            style,
                        };
                        let identity = (option.key.clone(), option.value.clone(), clang);
                        if seen_options.insert(identity) {
                            set.collect_paths(&option);
                            set.options.push(option);
                        }
                    }
                }
            }
        }

        self.partition_macros(&mut set, macro_sources);
        set
    }

    fn partition_macros(
        &self,
        set: &mut SanitizedOptionSet,
        macro_sources: BTreeMap<String, Vec<(ImageId, MacroDefinition)>>,
    ) {
        for (name, sources) in macro_sources {
            let distinct: BTreeSet<&MacroDirective> =
                sources.iter().map(|(_, def)| &def.directive).collect();
            let conflicting = distinct.len() > 1;

            match self.policy {
                MacroPolicy::PartitionPerImage => {
                    if conflicting {
                        set.conflicts.push(MacroConflict {
                            name: name.clone(),
                            definitions: sources
                                .iter()
                                .map(|(image, def)| (*image, def.directive.clone()))
                                .collect(),
                            winner: None,
                        });
                    }
                    for (image, definition) in sources {
                        set.image_macros.entry(image).or_default().push(definition);
                    }
                }
                MacroPolicy::FirstWins => {
                    let Some((winner, definition)) = sources.first().cloned() else {
                        continue;
                    };
                    if conflicting {
                        set.conflicts.push(MacroConflict {
                            name: name.clone(),
                            definitions: sources
                                .iter()
                                .map(|(image, def)| (*image, def.directive.clone()))
                                .collect(),
                            winner: Some(winner),
                        });
                    }
                    set.global_macros.push(definition);
                }
            }
        }
    }
}

impl SanitizedOptionSet {
    fn collect_paths(&mut self, option: &SanitizedOption) {
        let Some(value) = option.value.as_deref() else {
            return;
        };
        let list = match (option.key.as_str(), option.clang) {
            ("-I", false) => &mut self.include_paths,
            ("-F", false) => &mut self.framework_paths,
            ("-L", false) => &mut self.library_paths,
            ("-ivfsoverlay", _) => &mut self.vfs_overlays,
            _ => return,
        };
        let path = PathBuf::from(value);
        if !list.contains(&path) {
            list.push(path);
        }
    }
}

/// Split an argument list into classified options; the flag marks tokens that
/// arrived through `-Xcc`.
fn tokenize(args: &[String]) -> Vec<(Parsed, bool)> {
    let mut out = Vec::new();
    let mut index = 0;

    while index < args.len() {
        let token = args[index].as_str();
        index += 1;

        if token == "-Xcc" {
            let Some(nested) = args.get(index) else {
                break;
            };
            index += 1;
            // A separate value of a nested flag is itself wrapped: -Xcc -I -Xcc /path
            let next_value = match (args.get(index), args.get(index + 1)) {
                (Some(wrap), Some(value)) if wrap == "-Xcc" => Some(value.as_str()),
                _ => None,
            };
            let (parsed, consumed) = classify(nested, next_value);
            if consumed {
                index += 2;
            }
            out.push((parsed, true));
            continue;
        }

        let (parsed, consumed) = classify(token, args.get(index).map(String::as_str));
        if consumed {
            index += 1;
        }
        out.push((parsed, false));
    }

    out
}

/// Classify one token. Returns whether `next` was consumed as its value.
fn classify(token: &str, next: Option<&str>) -> (Parsed, bool) {
    if WARNINGS_AS_ERRORS.contains(&token) || token.starts_with("-Werror=") {
        return (Parsed::Suppressed(token.to_string()), false);
    }

    if token == "-D" || token == "-U" {
        return match next.and_then(|body| MacroDirective::parse(token, body)) {
            Some(directive) => (Parsed::Macro(directive), true),
            None => (option(token, None, ValueStyle::Separate), false),
        };
    }
    for flag in ["-D", "-U"] {
        if let Some(body) = token.strip_prefix(flag) {
            if let Some(directive) = MacroDirective::parse(flag, body) {
                return (Parsed::Macro(directive), false);
            }
        }
    }

    if VALUE_FLAGS.contains(&token) {
        return match next {
            Some(value) => (option(token, Some(value), ValueStyle::Separate), true),
            None => (option(token, None, ValueStyle::Separate), false),
        };
    }

    if let Some((key, value)) = token.split_once('=') {
        if VALUE_FLAGS.contains(&key) {
            return (option(key, Some(value), ValueStyle::Separate), false);
        }
        if key.starts_with('-') {
            return (option(key, Some(value), ValueStyle::Equals), false);
        }
    }

    for flag in ATTACHED_FLAGS {
        if let Some(value) = token.strip_prefix(flag) {
            if !value.is_empty() {
                return (option(flag, Some(value), ValueStyle::Separate), false);
            }
        }
    }

    (option(token, None, ValueStyle::Separate), false)
}

fn option(key: &str, value: Option<&str>, style: ValueStyle) -> Parsed {
    Parsed::Option {
        key: key.to_string(),
        value: value.map(str::to_string),
        style,
    }
}
