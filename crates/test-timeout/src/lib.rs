//! Test attributes that run the test body on a watchdog thread and fail the
//! test once it exceeds its wall-clock budget.
//!
//! ```ignore
//! #[test_timeout::timeout(5)]
//! fn quick() {}
//!
//! #[test_timeout::tokio_timeout_test(10, multi_thread)]
//! async fn concurrent() {}
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct TimeoutArgs {
    secs: u64,
    multi_thread: bool,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TimeoutArgs {
            secs: DEFAULT_TIMEOUT_SECS,
            multi_thread: false,
        };
        while !input.is_empty() {
            if input.peek(LitInt) {
                let lit: LitInt = input.parse()?;
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new(
                        lit.span(),
                        "timeout must be greater than zero",
                    ));
                }
                args.secs = secs;
            } else {
                let ident: Ident = input.parse()?;
                match ident.to_string().as_str() {
                    "multi_thread" => args.multi_thread = true,
                    "current_thread" => args.multi_thread = false,
                    other => {
                        return Err(syn::Error::new(
                            ident.span(),
                            format!("unknown runtime option `{other}`"),
                        ))
                    }
                }
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }
        Ok(args)
    }
}

/// Async test on a dedicated Tokio runtime, bounded by a timeout.
///
/// Accepts an optional number of seconds and an optional `multi_thread`
/// flag. A `#[tokio::test]` attribute on the same function is dropped.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let builder = if args.multi_thread {
        quote! { tokio::runtime::Builder::new_multi_thread().worker_threads(4) }
    } else {
        quote! { tokio::runtime::Builder::new_current_thread() }
    };
    let body = quote! {
        let runtime = #builder
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async move {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        });
    };

    let attrs = strip_attrs(attrs, |attr| path_is(attr, &["tokio", "test"]));
    watchdog(attrs, quote! { #vis #sig }, args.secs, body).into()
}

/// Synchronous test bounded by a timeout.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }
    if args.multi_thread {
        return syn::Error::new_spanned(
            &sig.ident,
            "runtime options only apply to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_attrs(attrs, |attr| path_is(attr, &["test"]));
    watchdog(attrs, quote! { #vis #sig }, args.secs, quote! { #block }).into()
}

fn watchdog(
    attrs: Vec<Attribute>,
    header: TokenStream2,
    secs: u64,
    body: TokenStream2,
) -> TokenStream2 {
    quote! {
        #[test]
        #(#attrs)*
        #header {
            let timeout_duration = ::std::time::Duration::from_secs(#secs);
            let (sender, receiver) = ::std::sync::mpsc::channel();
            ::std::thread::spawn(move || {
                let result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    }
}

fn strip_attrs(attrs: Vec<Attribute>, drop: impl Fn(&Attribute) -> bool) -> Vec<Attribute> {
    attrs.into_iter().filter(|attr| !drop(attr)).collect()
}

fn path_is(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments.iter().map(String::as_str).eq(expected.iter().copied())
}
