use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::quote;
use syn::ext::IdentExt;
use syn::{Ident, ItemFn, LitStr};

/// Proc macro to denote a Transaction
///
/// Each call of the annotated function becomes one timed, tagged sample. The metric name
/// defaults to the function name.
///
/// NOTE: Only works on `async` functions with a `Result<T, E>` return value. `T` must implement
/// `surge::transaction::ResponseStatus`.
///
/// # Example
/// ```ignore
/// use surge::prelude::*;
///
/// #[transaction(metric = "http_req", tags(type = "read"))]
/// async fn read_employees(client: &reqwest::Client) -> Result<reqwest::Response, reqwest::Error> {
///     client.get("http://localhost:8004/employee").send().await
/// }
/// ```
#[proc_macro_attribute]
pub fn transaction(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut args = TransactionArgs::default();
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("metric") {
            args.metric = Some(meta.value()?.parse()?);
            Ok(())
        } else if meta.path.is_ident("tags") {
            meta.parse_nested_meta(|tag| {
                let key = tag
                    .path
                    .get_ident()
                    .ok_or_else(|| tag.error("expected a tag name"))?
                    .unraw()
                    .to_string();
                let value: LitStr = tag.value()?.parse()?;
                args.tags.push((key, value));
                Ok(())
            })
        } else {
            Err(meta.error("expected `metric = \"...\"` or `tags(...)`"))
        }
    });
    syn::parse_macro_input!(attr with parser);

    let input = syn::parse_macro_input!(item as ItemFn);
    transaction_internal(args, input).into()
}

#[derive(Default)]
struct TransactionArgs {
    metric: Option<LitStr>,
    tags: Vec<(String, LitStr)>,
}

fn transaction_internal(args: TransactionArgs, input: ItemFn) -> TokenStream2 {
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = input;
    let stmts = &block.stmts;

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(sig.fn_token, "#[transaction] requires an async fn")
            .to_compile_error();
    }

    let metric = args
        .metric
        .unwrap_or_else(|| LitStr::new(&sig.ident.unraw().to_string(), sig.ident.span()));
    let (keys, values): (Vec<_>, Vec<_>) = args.tags.into_iter().unzip();

    quote! {
        #(#attrs)* #vis #sig {
            ::surge::transaction::transaction_hook(
                ::surge::transaction::TransactionLabels {
                    metric: #metric,
                    tags: &[#((#keys, #values)),*],
                },
                async move {
                    #(#stmts)*
                },
            ).await
        }
    }
}

/// Proc macro to denote a Scenario
///
/// NOTE: Currently this macro only works on functions which take no arguments. The function may
/// return `()` or `Result<(), E>`; an `Err` counts as a failed iteration.
///
/// The scenario name defaults to the function name and can be set with `name = "..."`. See the
/// `Scenario` struct for the methods this macro provides on functions.
///
/// # Example
/// ```ignore
/// use surge::prelude::*;
///
/// #[scenario(name = "read_load")]
/// async fn my_scenario() {
/// }
/// ```
#[proc_macro_attribute]
pub fn scenario(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut name: Option<LitStr> = None;
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("name") {
            name = Some(meta.value()?.parse()?);
            Ok(())
        } else {
            Err(meta.error("expected `name = \"...\"`"))
        }
    });
    syn::parse_macro_input!(attr with parser);

    let input = syn::parse_macro_input!(item as ItemFn);
    scenario_internal(name, input).into()
}

fn scenario_internal(name: Option<LitStr>, input: ItemFn) -> TokenStream2 {
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = input;
    let stmts = &block.stmts;

    if !sig.inputs.is_empty() {
        return syn::Error::new_spanned(&sig.inputs, "#[scenario] functions take no arguments")
            .to_compile_error();
    }

    let new_name = Ident::new(&format!("__surge_{}", sig.ident.unraw()), Span::call_site());
    let mut new_sig = sig.clone();
    new_sig.ident = new_name.clone();

    let scen_name = name
        .unwrap_or_else(|| LitStr::new(&sig.ident.unraw().to_string(), sig.ident.span()));
    let mut scen_sig = sig.clone();
    scen_sig.asyncness = None;
    scen_sig.output = syn::parse_quote! { -> ::surge::Scenario };

    quote! {
        #(#attrs)* #vis #scen_sig {
            ::surge::Scenario::new(#scen_name, #new_name)
        }

        #[doc(hidden)]
        #vis #new_sig {
            #(#stmts)*
        }
    }
}
