use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{DeriveInput, Fields, LitStr, Path, spanned::Spanned};

/// Checks for `#[repr(C)]`, which fixes the field order compiled programs rely on.
fn has_repr_c(input: &DeriveInput) -> syn::Result<bool> {
    let mut found = false;
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("repr")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("C") {
                found = true;
            }
            // skip arguments such as `align(16)`
            if meta.input.peek(syn::token::Paren) {
                let content;
                syn::parenthesized!(content in meta.input);
                let _: TokenStream = content.parse()?;
            }
            Ok(())
        })?;
    }
    Ok(found)
}

pub fn derive_descriptor_set(input: DeriveInput) -> TokenStream {
    // retrieve struct field information
    let fields = match &input.data {
        syn::Data::Struct(data_struct) => &data_struct.fields,
        _ => {
            return syn::Error::new(input.span(), "`DescriptorSet` can only be derived for structs")
                .to_compile_error();
        }
    };
    let fields = match fields {
        Fields::Named(fields_named) if !fields_named.named.is_empty() => &fields_named.named,
        _ => {
            return syn::Error::new(
                input.span(),
                "`DescriptorSet` requires a struct with at least one named field",
            )
            .to_compile_error();
        }
    };

    if !input.generics.params.is_empty() {
        return syn::Error::new(
            input.generics.span(),
            "generic descriptor sets are not supported",
        )
        .to_compile_error();
    }

    match has_repr_c(&input) {
        Ok(true) => {}
        Ok(false) => {
            return syn::Error::new(input.span(), "descriptor sets must be `#[repr(C)]`")
                .to_compile_error();
        }
        Err(err) => return err.to_compile_error(),
    }

    // parse descriptor_set attributes
    let mut crate_name = None;
    for attr in &input.attrs {
        if !attr.path().is_ident("descriptor_set") {
            continue;
        }

        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                let value = meta.value()?;
                let s: LitStr = value.parse()?;
                crate_name = Some(s.parse::<Path>()?);
                Ok(())
            } else {
                Err(meta.error("unexpected attribute; supported is `crate`"))
            }
        });

        if let Err(err) = result {
            return err.to_compile_error();
        }
    }
    let base_path = match crate_name {
        Some(path) => quote!(#path::memory::descriptor),
        None => quote!(::spindle::memory::descriptor),
    };

    let name = &input.ident;
    let vis = &input.vis;
    let count = fields.len();
    let types: Vec<_> = fields.iter().map(|f| &f.ty).collect();

    // one `bindingN` accessor per field, in declaration order
    let accessors = fields.iter().enumerate().map(|(index, field)| {
        let ident = &field.ident;
        let ty = &field.ty;
        let accessor = format_ident!("binding{}", index);
        let doc = format!("Binding {index} of the set.");
        quote! {
            #[doc = #doc]
            #[inline]
            #vis fn #accessor(&mut self) -> &mut #ty {
                &mut self.#ident
            }
        }
    });

    quote! {
        unsafe impl #base_path::DescriptorSet for #name {
            const BINDINGS: usize = #count;
        }

        const _: () = assert!(
            ::core::mem::size_of::<#name>() == 0 #(+ ::core::mem::size_of::<#types>())*,
            "descriptor sets must not contain padding",
        );

        impl #name {
            #(#accessors)*
        }
    }
}
