use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{Attribute, Ident, ItemFn, LitInt, Token, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Arguments accepted by `#[tokio_timeout_test(...)]`.
///
/// Both are optional and may appear in either order:
/// `#[tokio_timeout_test]`, `#[tokio_timeout_test(20)]`,
/// `#[tokio_timeout_test(20, multi_thread)]`.
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
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
                args.secs = secs;
            } else {
                let flavor: Ident = input.parse()?;
                match flavor.to_string().as_str() {
                    "multi_thread" => args.multi_thread = true,
                    "current_thread" => args.multi_thread = false,
                    _ => {
                        return Err(syn::Error::new_spanned(
                            flavor,
                            "expected a timeout in seconds, `multi_thread` or `current_thread`",
                        ));
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

/// Runs an async test on a fresh Tokio runtime and fails it if it does not
/// finish within the timeout. The runtime lives on its own thread so a
/// wedged test cannot take the harness down with it.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let TimeoutArgs { secs, multi_thread } = parse_macro_input!(attr as TimeoutArgs);

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

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let runtime_builder = if multi_thread {
        quote! {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
        }
    } else {
        quote! { tokio::runtime::Builder::new_current_thread() }
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #runtime_builder
                        .enable_all()
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            // Give the in-runtime timeout a moment to report before the
            // watchdog declares the thread lost.
            let watchdog = timeout_duration + std::time::Duration::from_secs(5);
            match receiver.recv_timeout(watchdog) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
