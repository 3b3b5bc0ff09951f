//! Augment tests of virtual time domains with procedural macros.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Ident, ItemFn, LitStr};

/// Levels accepted by [macro@test_traced].
const LEVELS: [&str; 5] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];

/// Run a test function with a `tracing` subscriber installed for its duration.
///
/// The optional argument is the maximum level to capture (defaults to `DEBUG`). Output is
/// written through the test harness, so it is only shown for failing tests (or when running
/// with `--nocapture`).
///
/// The crate using this macro must depend on `tracing` and `tracing-subscriber`.
///
/// # Example
///
/// ```rust,ignore
/// use warptime_macros::test_traced;
///
/// #[test_traced("TRACE")]
/// fn test_fast_forward() {
///     tracing::trace!("visible in failing test output");
/// }
/// ```
#[proc_macro_attribute]
pub fn test_traced(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);

    // Determine the requested level
    let level = if attr.is_empty() {
        "DEBUG".to_string()
    } else {
        let literal = parse_macro_input!(attr as LitStr);
        let value = literal.value().to_uppercase();
        if !LEVELS.contains(&value.as_str()) {
            return syn::Error::new(
                literal.span(),
                format!("invalid level `{}`, expected one of {:?}", value, LEVELS),
            )
            .to_compile_error()
            .into();
        }
        value
    };
    let level = Ident::new(&level, proc_macro2::Span::call_site());

    // Rebuild the function as a test wrapped in a scoped subscriber
    let attrs = &input.attrs;
    let vis = &input.vis;
    let name = &input.sig.ident;
    let body = &input.block;
    let expanded = quote! {
        #[test]
        #(#attrs)*
        #vis fn #name() {
            let subscriber = ::tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(::tracing::Level::#level)
                .with_line_number(true)
                .finish();
            let dispatcher = ::tracing::Dispatch::new(subscriber);
            ::tracing::dispatcher::with_default(&dispatcher, || #body)
        }
    };
    TokenStream::from(expanded)
}
