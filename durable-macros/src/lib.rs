//! Procedural macros for durable payload types.

mod utils;

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

/// Derive `durable_core::Durable` for a serializable type.
///
/// The registry name defaults to the type's identifier and can be pinned with
/// `#[durable(name = "...")]`, which keeps persisted jobs decodable across renames.
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize, Durable)]
/// #[durable(name = "counter")]
/// struct IncrementWorkflow { delta: i64 }
/// ```
#[proc_macro_derive(Durable, attributes(durable))]
pub fn derive_durable(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_durable(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand_durable(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let type_name = utils::type_name(input)?;
    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::durable_core::Durable for #ident #ty_generics #where_clause {
            const TYPE_NAME: &'static str = #type_name;
        }
    })
}
