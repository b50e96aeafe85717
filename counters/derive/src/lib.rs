// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `#[derive(Count)]`, adapted from Hubris's `lib/counters/derive`.
//!
//! Simplified from the teacher's version: this crate's `Count` impls run
//! inside real OS threads rather than single-threaded firmware, so counters
//! are plain `AtomicU32` with no `armv6m_atomic_hack` special-casing, and the
//! `#[count(children)]` nested-counter attribute (for an entry type whose
//! field is itself `Count`) is dropped — nothing in this workspace derives
//! `Count` on a field type, only on flat, fixed-variant diagnostic enums.
//! `#[count(skip)]` is kept: the handler-monitor and watchdog diagnostic
//! enums each have an initializer-only variant that should not consume a
//! counter slot.

extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::{Ident, Span};
use quote::{quote, ToTokens};
use syn::{parse_macro_input, DeriveInput};

#[proc_macro_derive(Count, attributes(count))]
pub fn derive_count(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match gen_count_impl(input) {
        Ok(tokens) => tokens.to_token_stream().into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn gen_count_impl(input: DeriveInput) -> Result<impl ToTokens, syn::Error> {
    let data_enum = match &input.data {
        syn::Data::Enum(data_enum) => data_enum,
        _ => {
            return Err(syn::Error::new_spanned(
                &input,
                "`Count` can only be derived for enums",
            ))
        }
    };

    let enum_name = &input.ident;
    let vis = &input.vis;
    let counts_ty = counts_ty(enum_name);

    let mut field_defs = Vec::new();
    let mut field_inits = Vec::new();
    let mut variant_patterns = Vec::new();
    let mut any_skipped = false;

    for variant in &data_enum.variants {
        let variant_name = &variant.ident;

        if is_skipped(variant)? {
            any_skipped = true;
            continue;
        }

        field_defs.push(quote! {
            #[doc = concat!(
                "Total recordings of [`", stringify!(#enum_name), "::",
                stringify!(#variant_name), "`]."
            )]
            pub #variant_name: core::sync::atomic::AtomicU32
        });
        field_inits.push(quote! {
            #variant_name: core::sync::atomic::AtomicU32::new(0)
        });

        let pattern = match &variant.fields {
            syn::Fields::Unit => quote! { #enum_name::#variant_name },
            syn::Fields::Named(_) => quote! { #enum_name::#variant_name { .. } },
            syn::Fields::Unnamed(_) => quote! { #enum_name::#variant_name(..) },
        };
        variant_patterns.push(quote! {
            #pattern => {
                counters.#variant_name.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
            }
        });
    }

    if any_skipped {
        variant_patterns.push(quote! { _ => {} });
    }

    Ok(quote! {
        #[doc = concat!("Per-variant counters for [`", stringify!(#enum_name), "`].")]
        #[allow(nonstandard_style)]
        #vis struct #counts_ty {
            #(#field_defs),*
        }

        #[automatically_derived]
        impl counters::Count for #enum_name {
            type Counters = #counts_ty;

            #[allow(clippy::declare_interior_mutable_const)]
            const NEW_COUNTERS: #counts_ty = #counts_ty {
                #(#field_inits),*
            };

            fn count(&self, counters: &Self::Counters) {
                match self {
                    #(#variant_patterns),*
                }
            }
        }
    })
}

fn is_skipped(variant: &syn::Variant) -> Result<bool, syn::Error> {
    for attr in &variant.attrs {
        if !attr.path().is_ident("count") {
            continue;
        }
        let mut skip = false;
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                skip = true;
                Ok(())
            } else {
                Err(meta.error("unsupported `count(..)` attribute"))
            }
        })?;
        return Ok(skip);
    }
    Ok(false)
}

fn counts_ty(ident: &Ident) -> Ident {
    Ident::new(&format!("{ident}Counts"), Span::call_site())
}
