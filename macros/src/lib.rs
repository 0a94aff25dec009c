//! Augment the development of callback-driven primitives with procedural macros.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::{format_ident, quote};
use syn::{
    parse_macro_input, AttributeArgs, Error, ItemFn, Lit, LitInt, LitStr, Meta, NestedMeta,
};

/// Levels accepted by [macro@test_traced].
const LEVELS: [&str; 5] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];

/// Run a test function with a [tracing] subscriber that writes to the test output.
///
/// The level defaults to `DEBUG` and can be set either positionally (`#[test_traced("WARN")]`)
/// or by name (`#[test_traced(level = "WARN")]`). With `timeout = <millis>`, the test body
/// runs on its own thread and the test panics with "timed out" if it has not finished in
/// time.
///
/// # Example
///
/// ```rust,ignore
/// use wanproxy_macros::test_traced;
/// use tracing::debug;
///
/// #[test_traced("TRACE")]
/// fn test_something() {
///     debug!("visible in the test output");
/// }
/// ```
#[proc_macro_attribute]
pub fn test_traced(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as AttributeArgs);
    let input = parse_macro_input!(item as ItemFn);
    match expand(args, input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

struct Options {
    level: String,
    timeout: Option<u64>,
}

fn parse_level(literal: &LitStr) -> Result<String, Error> {
    let level = literal.value().to_uppercase();
    if !LEVELS.contains(&level.as_str()) {
        return Err(Error::new(
            literal.span(),
            format!("invalid level `{}`; expected one of {:?}", literal.value(), LEVELS),
        ));
    }
    Ok(level)
}

fn parse_timeout(literal: &LitInt) -> Result<u64, Error> {
    let timeout: u64 = literal.base10_parse()?;
    if timeout == 0 {
        return Err(Error::new(literal.span(), "timeout must be non-zero"));
    }
    Ok(timeout)
}

fn parse_options(args: AttributeArgs) -> Result<Options, Error> {
    let mut options = Options {
        level: "DEBUG".to_string(),
        timeout: None,
    };
    for arg in args {
        match arg {
            NestedMeta::Lit(Lit::Str(literal)) => options.level = parse_level(&literal)?,
            NestedMeta::Meta(Meta::NameValue(pair)) if pair.path.is_ident("level") => {
                match &pair.lit {
                    Lit::Str(literal) => options.level = parse_level(literal)?,
                    other => return Err(Error::new_spanned(other, "level must be a string")),
                }
            }
            NestedMeta::Meta(Meta::NameValue(pair)) if pair.path.is_ident("timeout") => {
                match &pair.lit {
                    Lit::Int(literal) => options.timeout = Some(parse_timeout(literal)?),
                    other => return Err(Error::new_spanned(other, "timeout must be an integer")),
                }
            }
            other => return Err(Error::new_spanned(other, "unsupported argument")),
        }
    }
    Ok(options)
}

fn expand(args: AttributeArgs, input: ItemFn) -> Result<proc_macro2::TokenStream, Error> {
    let options = parse_options(args)?;
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = input;
    if sig.asyncness.is_some() {
        return Err(Error::new_spanned(&sig.fn_token, "test function cannot be async"));
    }
    if !sig.inputs.is_empty() {
        return Err(Error::new_spanned(&sig.inputs, "test function cannot take arguments"));
    }
    let level = format_ident!("{}", options.level, span = Span::call_site());
    let subscriber = quote! {
        ::tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(::tracing::Level::#level)
            .with_line_number(true)
            .finish()
    };

    let body = match options.timeout {
        None => quote! {
            let subscriber = #subscriber;
            ::tracing::subscriber::with_default(subscriber, || #block)
        },
        Some(timeout) => quote! {
            let (done, finished) = ::std::sync::mpsc::channel::<()>();
            let handle = ::std::thread::spawn(move || {
                let subscriber = #subscriber;
                let result = ::tracing::subscriber::with_default(subscriber, || #block);
                let _ = done.send(());
                result
            });
            match finished.recv_timeout(::std::time::Duration::from_millis(#timeout)) {
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {}ms", #timeout)
                }
                _ => match handle.join() {
                    Ok(result) => result,
                    Err(panic) => ::std::panic::resume_unwind(panic),
                },
            }
        },
    };

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}
