//! # Multidexing Macros
//!
//! This crate provides procedural macros for the Multidexing library.
//!
//! **Note**: These macros are re-exported by the main `multidexing` crate.
//! Users should import them from `multidexing` instead of depending on this crate directly:
//!
//! ```text
//! use multidexing::EntityRecord;
//! ```

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields, Ident, LitStr};

/// Implements `multidexing::EntityRecord` for a struct with named fields.
///
/// The entity kind defaults to the struct's name and the id to its `id` field.
/// Both can be overridden:
///
/// ```text
/// #[derive(Serialize, Deserialize, EntityRecord)]
/// #[entity(kind = "Pool")]
/// struct LiquidityPool {
///     #[entity(id)]
///     address: String,
///     reserve: u64,
/// }
/// ```
#[proc_macro_derive(EntityRecord, attributes(entity))]
pub fn derive_entity_record(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand_entity_record(&input) {
        Ok(tokens) => tokens.into(),
        Err(error) => error.to_compile_error().into(),
    }
}

fn expand_entity_record(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, type_generics, where_clause) = input.generics.split_for_impl();

    let mut kind = LitStr::new(&name.to_string(), name.span());
    for attr in input.attrs.iter().filter(|attr| attr.path().is_ident("entity")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("kind") {
                kind = meta.value()?.parse()?;
                Ok(())
            } else {
                Err(meta.error("expected `kind = \"...\"`"))
            }
        })?;
    }

    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            input,
            "EntityRecord can only be derived for structs",
        ));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new_spanned(
            &data.fields,
            "EntityRecord requires named fields",
        ));
    };

    let mut id_field: Option<&Ident> = None;
    for field in &fields.named {
        for attr in field.attrs.iter().filter(|attr| attr.path().is_ident("entity")) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("id") {
                    id_field = field.ident.as_ref();
                    Ok(())
                } else {
                    Err(meta.error("expected `id`"))
                }
            })?;
        }
    }

    let id_field = match id_field {
        Some(id_field) => id_field.clone(),
        None => fields
            .named
            .iter()
            .filter_map(|field| field.ident.as_ref())
            .find(|ident| *ident == "id")
            .cloned()
            .ok_or_else(|| {
                syn::Error::new(
                    Span::call_site(),
                    "EntityRecord needs an `id` field or a field marked `#[entity(id)]`",
                )
            })?,
    };

    Ok(quote! {
        impl #impl_generics ::multidexing::EntityRecord for #name #type_generics #where_clause {
            fn kind() -> &'static str {
                #kind
            }

            fn id(&self) -> String {
                ::std::string::ToString::to_string(&self.#id_field)
            }
        }
    })
}
