//! Procedural macros exported by `conduit-macros`.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse_macro_input, Error, Ident, ItemFn, LitStr};

/// Levels accepted by [macro@test_traced].
const LEVELS: [&str; 5] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];

/// Run a test with a `tracing` subscriber that writes to the test output.
///
/// The log level defaults to `DEBUG` and can be overridden with a string
/// literal (e.g. `#[test_traced("INFO")]`).
///
/// The subscriber is installed for the thread running the test body only, so
/// events emitted on runtime worker threads are not captured.
#[proc_macro_attribute]
pub fn test_traced(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);

    // Parse the requested level
    let level = if attr.is_empty() {
        "DEBUG".to_string()
    } else {
        let literal = parse_macro_input!(attr as LitStr);
        let level = literal.value().to_ascii_uppercase();
        if !LEVELS.contains(&level.as_str()) {
            return Error::new(
                literal.span(),
                "level must be one of TRACE, DEBUG, INFO, WARN, or ERROR",
            )
            .to_compile_error()
            .into();
        }
        level
    };
    let level = Ident::new(&level, Span::call_site());

    // Wrap the body with a scoped subscriber
    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;
    let expanded = quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let subscriber = ::conduit_macros::tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(::conduit_macros::tracing::Level::#level)
                .with_line_number(true)
                .finish();
            let dispatcher = ::conduit_macros::tracing::Dispatch::new(subscriber);
            ::conduit_macros::tracing::dispatcher::with_default(&dispatcher, || #block)
        }
    };
    TokenStream::from(expanded)
}
