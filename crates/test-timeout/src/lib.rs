//! `#[tokio_timeout_test]`: runs an async test on a fresh current-thread
//! runtime in its own thread and fails it once the deadline passes, even when
//! the body never yields.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 10;

struct TimeoutArgs {
    secs: u64,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(Self {
                secs: DEFAULT_TIMEOUT_SECS,
            });
        }
        if input.peek(Ident) {
            let key: Ident = input.parse()?;
            if key != "secs" {
                return Err(syn::Error::new(key.span(), "expected `secs = <seconds>`"));
            }
            input.parse::<Token![=]>()?;
        }
        let lit: LitInt = input.parse()?;
        let secs: u64 = lit.base10_parse()?;
        if secs == 0 {
            return Err(syn::Error::new(lit.span(), "timeout must be at least one second"));
        }
        Ok(Self { secs })
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let TimeoutArgs { secs } = parse_macro_input!(attr as TimeoutArgs);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(&sig.fn_token, "tokio_timeout_test needs an async fn")
            .to_compile_error()
            .into();
    }
    let attrs: Vec<Attribute> = attrs.into_iter().filter(|a| !is_test_marker(a)).collect();
    let name = sig.ident.to_string();
    let outcome = Ident::new("__timeout_outcome", Span::call_site());

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = ::std::time::Duration::from_secs(#secs);
            let (tx, rx) = ::std::sync::mpsc::channel();
            let worker = ::std::thread::Builder::new()
                .name(::std::string::String::from(#name))
                .spawn(move || {
                    let #outcome = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                        ::tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .expect("test runtime")
                            .block_on(async move {
                                if ::tokio::time::timeout(deadline, async move #block).await.is_err() {
                                    panic!("{} exceeded {}s", #name, #secs);
                                }
                            })
                    }));
                    let _ = tx.send(#outcome);
                })
                .expect("spawn test thread");
            match rx.recv_timeout(deadline + ::std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {
                    let _ = worker.join();
                }
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} blocked past {}s", #name, #secs)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} ended without reporting", #name)
                }
            }
        }
    })
}

fn is_test_marker(attr: &Attribute) -> bool {
    let path = attr.path();
    path.is_ident("test")
        || (path.segments.len() == 2
            && path.segments[0].ident == "tokio"
            && path.segments[1].ident == "test")
}
