use proc_macro2::{Spacing, TokenTree};
use quote::quote;
use syn::{parse_macro_input, Data, DataEnum, DataUnion, DeriveInput, Error, Meta, MetaList};

/// Derives `utils::bytes::Cast` for a `#[repr(C)]` or `#[repr(packed)]` struct whose
/// fields are themselves all `Cast`.
///
/// Every field in this crate's wire structs is a byte array or a byte-array-backed
/// newtype (see `utils::endian`), so alignment is always 1 and a plain pointer cast is
/// sound once the struct is known to carry no padding. For `repr(C)` that padding check
/// is a const-eval size assertion; `repr(packed)` has no padding by construction.
#[proc_macro_derive(Cast)]
pub fn bytes(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
	let DeriveInput { attrs, ident: name, data, .. } = parse_macro_input!(item as DeriveInput);

	let mut saw_repr = false;
	let mut packed = false;

	for attr in attrs {
		if let Meta::List(MetaList { path, tokens, .. }) = attr.meta {
			if path.is_ident("repr") {
				let mut last_was_delim = true;

				for token in tokens.into_iter() {
					match token {
						TokenTree::Punct(p) if !last_was_delim && p.as_char() == ',' && p.spacing() == Spacing::Alone => {
							last_was_delim = true;
							continue;
						}
						TokenTree::Ident(ident) if last_was_delim && ident == "C" => saw_repr = true,
						TokenTree::Ident(ident) if last_was_delim && ident == "packed" => {
							saw_repr = true;
							packed = true;
						}
						_ => return Error::new(token.span(), "unexpected token in repr(...)").to_compile_error().into(),
					}

					last_was_delim = false;
				}
			}
		}
	}

	if !saw_repr {
		return Error::new_spanned(&name, "Cast requires an explicit repr(C) or repr(packed)")
			.to_compile_error()
			.into();
	}

	let fields = match data {
		Data::Struct(s) => s.fields,
		Data::Enum(DataEnum { enum_token, .. }) => return Error::new_spanned(enum_token, "Cast does not support enums").to_compile_error().into(),
		Data::Union(DataUnion { union_token, .. }) => return Error::new_spanned(union_token, "Cast does not support unions").to_compile_error().into(),
	};

	let field_tys: Vec<_> = fields.iter().map(|f| &f.ty).collect();

	let no_padding = if packed {
		quote! {}
	} else {
		quote! {
			const _: () = assert!(
				::core::mem::size_of::<#name>() == 0 #( + ::core::mem::size_of::<#field_tys>() )*,
				"repr(C) struct deriving Cast must have no padding bytes"
			);
		}
	};

	quote! {
		#no_padding

		unsafe impl ::utils::bytes::Cast for #name where #( #field_tys: ::utils::bytes::Cast, )* {}
	}
	.into()
}
