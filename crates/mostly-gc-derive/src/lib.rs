//! Derive macro for the `Traverse` trait.

use proc_macro2::TokenStream;
use quote::{format_ident, quote, quote_spanned};
use syn::{
    parse_macro_input, parse_quote, spanned::Spanned, Data, DeriveInput, Fields, GenericParam,
    Generics, Ident, Index, Path,
};

/// Derive `Traverse` for a struct or enum.
///
/// The generated implementation forwards every field to its own
/// `Traverse` impl; pointer fields end up reporting themselves to the
/// scavenger, everything else is a no-op. Unions need a manual impl.
///
/// The implementing crate can be renamed with
/// `#[traverse(crate = path::to::mostly_gc)]`.
#[proc_macro_derive(Traverse, attributes(traverse))]
pub fn derive_traverse(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let mut krate: Path = parse_quote!(::mostly_gc);

    for attr in &input.attrs {
        if !attr.path().is_ident("traverse") {
            continue;
        }
        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                krate = meta.value()?.parse()?;
                Ok(())
            } else {
                Err(meta.error("unsupported attribute"))
            }
        });
        if let Err(err) = result {
            return err.into_compile_error().into();
        }
    }

    let name = &input.ident;
    let generics = add_trait_bounds(&krate, input.generics);
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let body = generate_body(&krate, name, &input.data);

    let generated = quote! {
        unsafe impl #impl_generics #krate::Traverse for #name #ty_generics #where_clause {
            #[inline]
            fn traverse(&mut self, sc: &mut #krate::Scavenger<'_>) {
                #body
            }
        }
    };
    generated.into()
}

fn add_trait_bounds(krate: &Path, mut generics: Generics) -> Generics {
    for param in &mut generics.params {
        if let GenericParam::Type(type_param) = param {
            let has_traverse = type_param.bounds.iter().any(|bound| {
                if let syn::TypeParamBound::Trait(t) = bound {
                    t.path.segments.last().is_some_and(|s| s.ident == "Traverse")
                } else {
                    false
                }
            });
            if !has_traverse {
                type_param.bounds.push(parse_quote!(#krate::Traverse));
            }
        }
    }
    generics
}

fn generate_body(krate: &Path, name: &Ident, data: &Data) -> TokenStream {
    match data {
        Data::Struct(data) => generate_struct_body(krate, &data.fields),
        Data::Enum(data) => generate_enum_body(krate, name, data),
        Data::Union(u) => quote_spanned! {
            u.union_token.span() =>
                compile_error!("`Traverse` must be manually implemented for unions");
        },
    }
}

fn generate_struct_body(krate: &Path, fields: &Fields) -> TokenStream {
    match fields {
        Fields::Named(f) => {
            let calls = f.named.iter().map(|field| {
                let name = &field.ident;
                quote_spanned! {field.span() =>
                    #krate::Traverse::traverse(&mut self.#name, sc);
                }
            });
            quote! { #(#calls)* }
        }
        Fields::Unnamed(f) => {
            let calls = f.unnamed.iter().enumerate().map(|(i, field)| {
                let index = Index::from(i);
                quote_spanned! {field.span() =>
                    #krate::Traverse::traverse(&mut self.#index, sc);
                }
            });
            quote! { #(#calls)* }
        }
        Fields::Unit => quote! {},
    }
}

fn generate_enum_body(krate: &Path, name: &Ident, data: &syn::DataEnum) -> TokenStream {
    let arms = data.variants.iter().map(|variant| {
        let var_name = &variant.ident;
        match &variant.fields {
            Fields::Named(f) => {
                let bindings: Vec<_> = (0..f.named.len())
                    .map(|i| format_ident!("field{}", i))
                    .collect();
                let idents: Vec<_> = f.named.iter().map(|f| f.ident.as_ref().unwrap()).collect();
                let calls = bindings.iter().map(|binding| {
                    quote! { #krate::Traverse::traverse(#binding, sc); }
                });
                quote! {
                    #name::#var_name { #(#idents: #bindings),* } => {
                        #(#calls)*
                    }
                }
            }
            Fields::Unnamed(f) => {
                let bindings: Vec<_> = (0..f.unnamed.len())
                    .map(|i| format_ident!("field{}", i))
                    .collect();
                let calls = bindings.iter().map(|binding| {
                    quote! { #krate::Traverse::traverse(#binding, sc); }
                });
                quote! {
                    #name::#var_name(#(#bindings),*) => {
                        #(#calls)*
                    }
                }
            }
            Fields::Unit => quote! {
                #name::#var_name => {}
            },
        }
    });
    quote! {
        match self {
            #(#arms)*
        }
    }
}
