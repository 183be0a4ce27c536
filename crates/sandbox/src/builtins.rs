//! Built-in text bundle.
//!
//! A small native bundle shipped with the host, written exactly the way an
//! extension author would write one: a single module defined through the
//! exports-mutation pattern, exposing data and function exports plus one
//! operation-contract entry point. It doubles as the default content the
//! binary serves and as realistic material for end-to-end tests.

use std::sync::Arc;

use url::Url;

use pipeforge_core::{ErrorProxy, ExtFunction, ExtValue};

use crate::resolver::{FnScript, StaticResolver};

/// URL of the built-in text bundle.
pub fn text_bundle_url() -> Url {
    Url::parse("builtin://text").expect("static bundle url")
}

/// Register the built-in bundles on a resolver.
pub fn register_builtins(resolver: &StaticResolver) {
    resolver.register(text_bundle_url(), Arc::new(FnScript::new(define_text_module)));
}

fn define_text_module(scope: &mut pipeforge_loader::ScriptScope<'_>) -> pipeforge_core::Result<()> {
    scope.define(
        Some("text"),
        Some(vec!["exports".to_string()]),
        Box::new(|slots| {
            if let ExtValue::Object(entries) = &mut slots[0] {
                entries.insert("VERSION".to_string(), ExtValue::string("1.2.0"));
                entries.insert(
                    "reverse".to_string(),
                    ExtValue::Function(ExtFunction::from_sync(1, reverse)),
                );
                entries.insert(
                    "mirror".to_string(),
                    ExtValue::Function(ExtFunction::from_sync(1, mirror)),
                );
            }
            Ok(ExtValue::Null)
        }),
    )
}

fn reverse(args: Vec<ExtValue>) -> Result<ExtValue, ErrorProxy> {
    match args[0].as_str() {
        Some(text) => Ok(ExtValue::String(text.chars().rev().collect())),
        None => Err(ErrorProxy::new("Error", "reverse expects a string")),
    }
}

/// Operation-contract entry point: reverses the `text` control.
fn mirror(args: Vec<ExtValue>) -> Result<ExtValue, ErrorProxy> {
    let controls = args[0]
        .as_object()
        .ok_or_else(|| ErrorProxy::new("Error", "mirror expects a controls object"))?;
    let text = controls
        .get("values")
        .and_then(ExtValue::as_object)
        .and_then(|values| values.get("text"))
        .and_then(ExtValue::as_str)
        .ok_or_else(|| ErrorProxy::new("Error", "control 'text' must be a string"))?;

    let reversed: String = text.chars().rev().collect();
    Ok(ExtValue::object([(
        "changes".to_string(),
        ExtValue::array([ExtValue::object([
            ("control".to_string(), ExtValue::string("text")),
            ("value".to_string(), ExtValue::String(reversed)),
        ])]),
    )]))
}
