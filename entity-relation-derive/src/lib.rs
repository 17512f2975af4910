use proc_macro::TokenStream;
use quote::quote;
use syn::{
    Data, DeriveInput, Fields, GenericArgument, Ident, LitStr, PathArguments, Type,
    ext::IdentExt, parse_macro_input, spanned::Spanned,
};

/// Derives `entity_relation::Entity`.
///
/// Struct attribute: `#[entity(table = "...")]` (defaults to the snake_case type name).
///
/// Persistent field attributes: `#[entity(id)]`, `#[entity(deleted_flag)]`,
/// `#[entity(update_time)]`, `#[entity(column = "...")]`, `#[entity(skip)]`.
///
/// Relation target fields carry `#[relation(dict)]`, `#[relation(object)]` or
/// `#[relation(aggregate)]` and must be declared as `Option<_>`.
#[proc_macro_derive(Entity, attributes(entity, relation))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum RelationKind {
    Dict,
    Object,
    Aggregate,
}

struct PersistentField<'a> {
    ident: &'a Ident,
    name: String,
    column: String,
}

struct RelationField<'a> {
    ident: &'a Ident,
    name: String,
    kind: RelationKind,
    // `Option<T>` -> `T`, with `Option<Box<T>>` unwrapped to `T` and flagged.
    inner: &'a Type,
    boxed: bool,
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let struct_name = &input.ident;
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new(
            input.generics.span(),
            "generic entities are not supported",
        ));
    }

    let mut table = to_snake_case(&struct_name.to_string());
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("entity")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                let lit: LitStr = meta.value()?.parse()?;
                table = lit.value();
                Ok(())
            } else {
                Err(meta.error("unsupported entity attribute, expected `table`"))
            }
        })?;
    }

    let named = match &input.data {
        Data::Struct(data_struct) => match &data_struct.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new(
                    struct_name.span(),
                    "Entity can only be derived for structs with named fields",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Entity can only be derived for structs",
            ));
        }
    };

    let mut persistent = Vec::new();
    let mut relations = Vec::new();
    let mut id_field: Option<String> = None;
    let mut deleted_flag_field: Option<String> = None;
    let mut update_time_field: Option<String> = None;

    for field in named.iter() {
        let Some(ident) = field.ident.as_ref() else {
            continue;
        };
        let name = ident.unraw().to_string();

        // 关联字段：不落库，由物化引擎回填
        if let Some(attr) = field.attrs.iter().find(|a| a.path().is_ident("relation")) {
            let mut kind = None;
            attr.parse_nested_meta(|meta| {
                kind = Some(if meta.path.is_ident("dict") {
                    RelationKind::Dict
                } else if meta.path.is_ident("object") {
                    RelationKind::Object
                } else if meta.path.is_ident("aggregate") {
                    RelationKind::Aggregate
                } else {
                    return Err(meta.error("expected `dict`, `object` or `aggregate`"));
                });
                Ok(())
            })?;
            let kind = kind.ok_or_else(|| {
                syn::Error::new(attr.span(), "expected `dict`, `object` or `aggregate`")
            })?;
            let Some(inner) = generic_inner(&field.ty, "Option") else {
                return Err(syn::Error::new(
                    field.ty.span(),
                    "relation fields must be declared as Option<_>",
                ));
            };
            let (inner, boxed) = match generic_inner(inner, "Box") {
                Some(unboxed) if kind == RelationKind::Object => (unboxed, true),
                _ => (inner, false),
            };
            relations.push(RelationField {
                ident,
                name,
                kind,
                inner,
                boxed,
            });
            continue;
        }

        let mut column = name.clone();
        let mut skip = false;
        for attr in field.attrs.iter().filter(|a| a.path().is_ident("entity")) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("id") {
                    id_field = Some(name.clone());
                } else if meta.path.is_ident("deleted_flag") {
                    deleted_flag_field = Some(name.clone());
                } else if meta.path.is_ident("update_time") {
                    update_time_field = Some(name.clone());
                } else if meta.path.is_ident("skip") {
                    skip = true;
                } else if meta.path.is_ident("column") {
                    let lit: LitStr = meta.value()?.parse()?;
                    column = lit.value();
                } else {
                    return Err(meta.error(
                        "expected `id`, `deleted_flag`, `update_time`, `column` or `skip`",
                    ));
                }
                Ok(())
            })?;
        }
        if !skip {
            persistent.push(PersistentField {
                ident,
                name,
                column,
            });
        }
    }

    let id_field = match id_field {
        Some(id) => id,
        None if persistent.iter().any(|f| f.name == "id") => "id".to_string(),
        None => {
            return Err(syn::Error::new(
                struct_name.span(),
                "missing #[entity(id)] field",
            ));
        }
    };

    let struct_name_str = struct_name.to_string();
    let deleted_flag_tokens = option_str(&deleted_flag_field);
    let update_time_tokens = option_str(&update_time_field);

    let field_metas = persistent.iter().map(|f| {
        let name = &f.name;
        let column = &f.column;
        quote! { entity_relation::FieldMeta { name: #name, column: #column } }
    });
    let relation_names = relations.iter().map(|r| &r.name);

    let value_arms = persistent.iter().map(|f| {
        let ident = f.ident;
        let name = &f.name;
        quote! {
            #name => ::core::option::Option::Some(entity_relation::ToValue::to_value(&self.#ident)),
        }
    });

    let assign_arms = relations.iter().map(|r| {
        let ident = r.ident;
        let name = &r.name;
        let inner = r.inner;
        let converted = match r.kind {
            RelationKind::Dict => quote! { related.into_dict(field)? },
            RelationKind::Object if r.boxed => {
                quote! { ::std::boxed::Box::new(related.into_object::<#inner>(field)?) }
            }
            RelationKind::Object => quote! { related.into_object::<#inner>(field)? },
            RelationKind::Aggregate => quote! { related.into_aggregate::<#inner>(field)? },
        };
        quote! {
            #name => {
                self.#ident = ::core::option::Option::Some(#converted);
                ::core::result::Result::Ok(())
            }
        }
    });

    let nested_arms = relations
        .iter()
        .filter(|r| r.kind == RelationKind::Object)
        .map(|r| {
            let ident = r.ident;
            let name = &r.name;
            let borrow = if r.boxed {
                quote! { self.#ident.as_deref() }
            } else {
                quote! { self.#ident.as_ref() }
            };
            quote! {
                #name => #borrow.map(|v| v as &dyn entity_relation::DynEntity),
            }
        });

    let expanded = quote! {
        impl entity_relation::Entity for #struct_name {
            fn meta() -> &'static entity_relation::EntityMeta {
                static META: entity_relation::EntityMeta = entity_relation::EntityMeta {
                    name: #struct_name_str,
                    type_path: concat!(module_path!(), "::", stringify!(#struct_name)),
                    table: #table,
                    id_field: #id_field,
                    deleted_flag_field: #deleted_flag_tokens,
                    update_time_field: #update_time_tokens,
                    fields: &[#(#field_metas),*],
                    relation_fields: &[#(#relation_names),*],
                };
                &META
            }

            fn value(&self, field: &str) -> ::core::option::Option<entity_relation::Value> {
                match field {
                    #(#value_arms)*
                    _ => ::core::option::Option::None,
                }
            }

            #[allow(unused_variables)]
            fn assign(
                &mut self,
                field: &str,
                related: entity_relation::Related,
            ) -> ::core::result::Result<(), entity_relation::Error> {
                match field {
                    #(#assign_arms)*
                    _ => ::core::result::Result::Err(entity_relation::Error::UnknownRelationField {
                        entity: #struct_name_str,
                        field: field.to_string(),
                    }),
                }
            }

            fn nested(
                &self,
                field: &str,
            ) -> ::core::option::Option<&dyn entity_relation::DynEntity> {
                match field {
                    #(#nested_arms)*
                    _ => ::core::option::Option::None,
                }
            }
        }

        entity_relation::inventory::submit! {
            entity_relation::EntityRegistration {
                meta: <#struct_name as entity_relation::Entity>::meta,
            }
        }
    };

    Ok(expanded)
}

fn option_str(value: &Option<String>) -> proc_macro2::TokenStream {
    match value {
        Some(v) => quote! { ::core::option::Option::Some(#v) },
        None => quote! { ::core::option::Option::None },
    }
}

// `Wrapper<T>` -> `T` when the last path segment is `wrapper`.
fn generic_inner<'a>(ty: &'a Type, wrapper: &str) -> Option<&'a Type> {
    let Type::Path(type_path) = ty else {
        return None;
    };
    let segment = type_path.path.segments.last()?;
    if segment.ident != wrapper {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    match args.args.first()? {
        GenericArgument::Type(inner) => Some(inner),
        _ => None,
    }
}

fn to_snake_case(name: &str) -> String {
    let mut snake = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                snake.push('_');
            }
            snake.extend(ch.to_lowercase());
        } else {
            snake.push(ch);
        }
    }
    snake
}
