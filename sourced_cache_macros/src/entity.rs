use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, LitStr};

pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let namespace = match extract_namespace(&input) {
        Ok(Some(ns)) => quote! { ::core::option::Option::Some(#ns) },
        Ok(None) => quote! { ::core::option::Option::None },
        Err(err) => return err.to_compile_error().into(),
    };

    let (id_field, id_type) = match extract_id_field(&input) {
        Ok(found) => found,
        Err(err) => return err.to_compile_error().into(),
    };

    let expanded = quote! {
        impl #impl_generics ::sourced_cache::Entity for #name #ty_generics #where_clause {
            type Id = #id_type;

            const NAMESPACE: ::core::option::Option<&'static str> = #namespace;

            fn id(&self) -> &Self::Id {
                &self.#id_field
            }

            fn set_id(&mut self, id: Self::Id) {
                self.#id_field = id;
            }
        }
    };

    TokenStream::from(expanded)
}

fn extract_namespace(input: &DeriveInput) -> syn::Result<Option<String>> {
    for attr in &input.attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }

        let mut namespace = None;
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("namespace") {
                let value: LitStr = meta.value()?.parse()?;
                namespace = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("unsupported entity attribute, expected `namespace = \"...\"`"))
            }
        })?;

        if namespace.is_some() {
            return Ok(namespace);
        }
    }

    Ok(None)
}

fn extract_id_field(input: &DeriveInput) -> syn::Result<(syn::Ident, syn::Type)> {
    let fields = match &input.data {
        Data::Struct(data_struct) => match &data_struct.fields {
            Fields::Named(fields) => fields,
            _ => {
                return Err(syn::Error::new_spanned(
                    &input.ident,
                    "Entity derive: only structs with named fields are supported",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                &input.ident,
                "Entity derive: only structs are supported",
            ))
        }
    };

    for field in &fields.named {
        for attr in &field.attrs {
            if !attr.path().is_ident("entity") {
                continue;
            }
            let mut is_id = false;
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("id") {
                    is_id = true;
                    Ok(())
                } else {
                    Err(meta.error("unsupported field attribute, expected `id`"))
                }
            })?;
            if is_id {
                if let Some(ident) = &field.ident {
                    return Ok((ident.clone(), field.ty.clone()));
                }
            }
        }
    }

    // Default: a field named "id"
    for field in &fields.named {
        if let Some(ident) = &field.ident {
            if ident == "id" {
                return Ok((ident.clone(), field.ty.clone()));
            }
        }
    }

    Err(syn::Error::new_spanned(
        &input.ident,
        "Entity derive: no field marked with #[entity(id)] and no field named `id`",
    ))
}
