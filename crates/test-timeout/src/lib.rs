use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Runs an async test on a fresh current-thread runtime and fails it if it has
/// not finished after the given number of seconds (default 10).
///
/// ```ignore
/// #[test_timeout::tokio_timeout_test(5)]
/// async fn reconnects() { /* ... */ }
/// ```
///
/// The runtime lives on a helper thread so a test that blocks the executor
/// still trips the deadline instead of hanging the harness.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = if attr.is_empty() {
        DEFAULT_TIMEOUT_SECS
    } else {
        let lit = parse_macro_input!(attr as LitInt);
        match lit.base10_parse::<u64>() {
            Ok(0) => {
                return syn::Error::new_spanned(lit, "timeout must be greater than zero")
                    .to_compile_error()
                    .into();
            }
            Ok(secs) => secs,
            Err(err) => return err.to_compile_error().into(),
        }
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test expects an async test function",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();
    let name = sig.ident.to_string();

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = ::std::time::Duration::from_secs(#timeout_secs);
            let (done_tx, done_rx) = ::std::sync::mpsc::channel();
            ::std::thread::Builder::new()
                .name(::std::format!("test-{}", #name))
                .spawn(move || {
                    let outcome = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                        ::tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .expect("build test runtime")
                            .block_on(async move #block)
                    }));
                    let _ = done_tx.send(outcome);
                })
                .expect("spawn test thread");
            match done_rx.recv_timeout(deadline) {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => ::std::panic::resume_unwind(panic),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} did not finish within {:?}", #name, deadline)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} exited without reporting a result", #name)
                }
            }
        }
    })
}

/// Drops `#[test]` and `#[tokio::test]` so the generated wrapper is the only
/// test entry point.
fn is_test_marker(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
