//! # Builder-style setters
//!
//! `#[derive(Setters)]` gives configuration structs a `with_<field>` method
//! per named field, so a value can be built up from its `Default` in a
//! single expression:
//!
//! ```
//! use utils_accessors_derive::Setters;
//!
//! #[derive(Default, Setters)]
//! struct Layout {
//!     /// Bytes to grow by.
//!     growth: u64,
//!     #[setters(into)]
//!     root: Option<u64>,
//!     #[setters(skip)]
//!     generation: u32,
//! }
//!
//! const SMALL: Layout = Layout { growth: 0, root: None, generation: 0 }.with_growth(4096);
//! let l = SMALL.with_root(0x1000);
//! assert_eq!(l.growth, 4096);
//! assert_eq!(l.root, Some(0x1000));
//! assert_eq!(l.generation, 0);
//! ```
//!
//! Field options, given as `#[setters(...)]`:
//! - `skip`: no setter for this field.
//! - `into`: the setter takes `impl Into<T>`. Such setters are not `const`.
//!
//! Doc comments on a field are carried over to its setter.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Attribute, Data, DeriveInput, Fields, parse_macro_input, spanned::Spanned};

#[derive(Default)]
struct FieldOptions {
    skip: bool,
    into: bool,
}

#[proc_macro_derive(Setters, attributes(setters))]
pub fn derive_setters(input: TokenStream) -> TokenStream {
    let DeriveInput {
        ident,
        generics,
        data,
        ..
    } = parse_macro_input!(input as DeriveInput);

    let fields = match data {
        Data::Struct(s) => match s.fields {
            Fields::Named(n) => n.named,
            other => {
                return syn::Error::new(other.span(), "Setters needs named fields")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new(ident.span(), "Setters can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut methods = Vec::new();
    for field in &fields {
        let Some(name) = &field.ident else { continue };
        let options = match field_options(&field.attrs) {
            Ok(o) => o,
            Err(e) => return e.to_compile_error().into(),
        };
        if options.skip {
            continue;
        }

        let ty = &field.ty;
        let docs = field.attrs.iter().filter(|a| a.path().is_ident("doc"));
        let setter = format_ident!("with_{}", name);

        methods.push(if options.into {
            quote! {
                #(#docs)*
                #[inline]
                #[must_use]
                pub fn #setter(mut self, value: impl ::core::convert::Into<#ty>) -> Self {
                    self.#name = value.into();
                    self
                }
            }
        } else {
            quote! {
                #(#docs)*
                #[inline]
                #[must_use]
                pub const fn #setter(mut self, value: #ty) -> Self {
                    self.#name = value;
                    self
                }
            }
        });
    }

    quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    }
    .into()
}

fn field_options(attrs: &[Attribute]) -> syn::Result<FieldOptions> {
    let mut options = FieldOptions::default();
    for attr in attrs.iter().filter(|a| a.path().is_ident("setters")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                options.skip = true;
                Ok(())
            } else if meta.path.is_ident("into") {
                options.into = true;
                Ok(())
            } else {
                Err(meta.error("expected `skip` or `into`"))
            }
        })?;
    }
    Ok(options)
}
