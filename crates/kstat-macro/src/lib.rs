// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::format_ident;
use quote::quote;
use syn::Data;
use syn::DeriveInput;
use syn::Fields;
use syn::Ident;
use syn::parse_macro_input;
use syn::spanned::Spanned;

/// Generate an [`offload::ddi::kstat::KStatProvider`] implementation
/// given a struct of named fields of type
/// [`offload::ddi::kstat::KStatU64`].
///
/// ```Rust
/// #[derive(KStatProvider)]
/// struct OffloadStats {
///     accelerated: KStatU64,
///     pending_decel: KStatU64,
/// }
/// ```
///
/// Along with the trait implementation a plain `OffloadStatsSnap`
/// struct is generated, holding one `u64` per field, which is what
/// `snapshot()` returns. The snapshot is serde-serializable so the
/// consuming crate must depend on `serde`.
#[proc_macro_derive(KStatProvider)]
pub fn derive_kstat_provider(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(input) {
        Ok(ts) => ts.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream2> {
    let DeriveInput { ident, data, .. } = input;
    let named = match data {
        Data::Struct(s) => match s.fields {
            Fields::Named(named) => named.named,
            other => {
                return Err(syn::Error::new(
                    other.span(),
                    "a KStatProvider must have named fields",
                ));
            }
        },

        _ => {
            return Err(syn::Error::new(
                ident.span(),
                "only a struct may be a KStatProvider",
            ));
        }
    };

    let num_fields = named.len() as u32;
    let fields: Vec<Ident> =
        named.into_iter().filter_map(|f| f.ident).collect();
    let ident_snap = format_ident!("{}Snap", ident);

    Ok(quote! {
        #[derive(
            Clone,
            Debug,
            Default,
            Eq,
            PartialEq,
            ::serde::Deserialize,
            ::serde::Serialize,
        )]
        pub struct #ident_snap {
            #( pub #fields: u64, )*
        }

        impl ::offload::ddi::kstat::KStatProvider for #ident {
            const NUM_FIELDS: u32 = #num_fields;
            type Snap = #ident_snap;

            fn init(
                &mut self
            ) -> core::result::Result<(), ::offload::ddi::kstat::Error> {
                #( self.#fields.init(stringify!(#fields))?; )*
                Ok(())
            }

            fn new() -> Self {
                use ::offload::ddi::kstat::KStatU64;

                Self {
                    #( #fields: KStatU64::new(), )*
                }
            }

            fn snapshot(&self) -> Self::Snap {
                #ident_snap {
                    #( #fields: self.#fields.val(), )*
                }
            }
        }
    })
}
