use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod descriptor;

#[proc_macro_derive(DescriptorSet, attributes(descriptor_set))]
pub fn derive_descriptor_set(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let expanded = descriptor::derive_descriptor_set(input);
    expanded.into()
}
