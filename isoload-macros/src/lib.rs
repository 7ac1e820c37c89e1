//! isoload Macros
//!
//! Procedural macros for load-test operation registration.
//!
//! ## Macros
//!
//! - `#[isoload::load_tasks]` - Register the flagged methods of an impl block
//! - `#[isoload::load_task]` - Flag a method inside such a block as an operation

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{FnArg, ImplItem, ItemImpl, Type, parse_macro_input};

// ============================================================================
// Attribute Parsing Helpers
// ============================================================================

mod attr {
    use syn::meta::ParseNestedMeta;

    /// Get the attribute name as a string
    pub fn name(meta: &ParseNestedMeta) -> String {
        meta.path
            .get_ident()
            .map(|i| i.to_string())
            .unwrap_or_default()
    }

    /// Parse a string literal attribute: `attr = "value"`
    pub fn string(meta: &ParseNestedMeta) -> syn::Result<String> {
        let value: syn::LitStr = meta.value()?.parse()?;
        Ok(value.value())
    }

    /// Parse an integer literal attribute: `attr = 42`
    pub fn int<T>(meta: &ParseNestedMeta) -> syn::Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let value: syn::LitInt = meta.value()?.parse()?;
        value.base10_parse()
    }

    /// Create an unknown attribute error
    pub fn unknown(meta: &ParseNestedMeta, name: &str) -> syn::Error {
        meta.error(format!("unknown attribute: {}", name))
    }
}

/// Whether an attribute is `#[load_task]` under any path
fn is_load_task(attr: &syn::Attribute) -> bool {
    attr.path()
        .segments
        .last()
        .is_some_and(|seg| seg.ident == "load_task")
}

/// Register the `#[load_task]` methods of an impl block as load-test
/// operations
///
/// Every flagged method becomes an operation named after the method. Each
/// invocation builds a fresh instance of the type with `Default`, so the
/// type must implement it. Methods take `&self` or `&mut self` and no other
/// arguments, and return either `Spec` or `Result<Spec, E>` for any error
/// convertible into `anyhow::Error`.
///
/// # Example
///
/// ```ignore
/// #[derive(Default)]
/// struct ServiceXTasks;
///
/// #[isoload::load_tasks]
/// impl ServiceXTasks {
///     #[load_task]
///     fn uproot_raw_query(&self) -> Spec { ... }
///
///     #[load_task(weight = 3)]
///     fn func_adl_xaod_simple(&self) -> anyhow::Result<Spec> { ... }
///
///     // Not an operation
///     fn shared_files(&self) -> Vec<String> { ... }
/// }
/// ```
#[proc_macro_attribute]
pub fn load_tasks(args: TokenStream, item: TokenStream) -> TokenStream {
    let args = TokenStream2::from(args);
    let item = parse_macro_input!(item as ItemImpl);

    load_tasks_impl(args, item)
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}

/// Flag a method as a load-test operation
///
/// Only valid inside an impl block annotated with `#[load_tasks]`, which
/// consumes the flag.
///
/// Options: `name = "..."` overrides the operation name, `weight = N` sets the
/// relative scheduling weight of the bound task (default 1).
#[proc_macro_attribute]
pub fn load_task(_args: TokenStream, item: TokenStream) -> TokenStream {
    let item = TokenStream2::from(item);
    quote! {
        ::core::compile_error!("#[load_task] must be used on a method inside a #[load_tasks] impl block");
        #item
    }
    .into()
}

struct TaskConfig {
    name: Option<String>,
    weight: u32,
}

fn parse_task_config(attr: &syn::Attribute) -> syn::Result<TaskConfig> {
    let mut config = TaskConfig {
        name: None,
        weight: 1,
    };

    // Bare `#[load_task]` has no argument list
    if matches!(attr.meta, syn::Meta::Path(_)) {
        return Ok(config);
    }

    attr.parse_nested_meta(|meta| {
        let name = attr::name(&meta);
        match name.as_str() {
            "name" => config.name = Some(attr::string(&meta)?),
            "weight" => {
                let weight: u32 = attr::int(&meta)?;
                if weight == 0 {
                    return Err(meta.error("weight must be at least 1"));
                }
                config.weight = weight;
            }
            _ => return Err(attr::unknown(&meta, &name)),
        }
        Ok(())
    })?;

    Ok(config)
}

fn owner_ident(self_ty: &Type) -> syn::Result<&syn::Ident> {
    match self_ty {
        Type::Path(path) if path.qself.is_none() => path
            .path
            .segments
            .last()
            .map(|seg| &seg.ident)
            .ok_or_else(|| syn::Error::new_spanned(self_ty, "expected a type name")),
        _ => Err(syn::Error::new_spanned(
            self_ty,
            "#[load_tasks] requires an impl block for a named type",
        )),
    }
}

fn validate_method(method: &syn::ImplItemFn) -> syn::Result<()> {
    let sig = &method.sig;

    if sig.asyncness.is_some() {
        return Err(syn::Error::new_spanned(
            sig.asyncness,
            "load-test operations cannot be async; return a specification and let delivery run it",
        ));
    }
    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &sig.generics,
            "load-test operations cannot be generic",
        ));
    }

    let mut inputs = sig.inputs.iter();
    match inputs.next() {
        Some(FnArg::Receiver(receiver)) if receiver.reference.is_some() => {}
        _ => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "load-test operations must take &self or &mut self",
            ));
        }
    }
    if let Some(extra) = inputs.next() {
        return Err(syn::Error::new_spanned(
            extra,
            "load-test operations take no arguments besides self",
        ));
    }

    Ok(())
}

fn load_tasks_impl(args: TokenStream2, mut item: ItemImpl) -> Result<TokenStream2, syn::Error> {
    if !args.is_empty() {
        return Err(syn::Error::new_spanned(
            args,
            "#[load_tasks] takes no arguments",
        ));
    }
    if item.trait_.is_some() {
        return Err(syn::Error::new_spanned(
            &item.self_ty,
            "#[load_tasks] must be placed on an inherent impl block",
        ));
    }
    if !item.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &item.generics,
            "#[load_tasks] does not support generic impl blocks",
        ));
    }

    let self_ty = item.self_ty.clone();
    let owner = owner_ident(&self_ty)?.clone();
    let owner_str = owner.to_string();

    let mut wrappers = Vec::new();
    let mut registrations = Vec::new();
    let mut operation_names = Vec::new();

    for impl_item in &mut item.items {
        let ImplItem::Fn(method) = impl_item else {
            continue;
        };

        let Some(position) = method.attrs.iter().position(is_load_task) else {
            continue;
        };
        let flag = method.attrs.remove(position);
        if let Some(dup) = method.attrs.iter().find(|a| is_load_task(a)) {
            return Err(syn::Error::new_spanned(dup, "duplicate #[load_task]"));
        }

        validate_method(method)?;
        let config = parse_task_config(&flag)?;

        let method_ident = &method.sig.ident;
        let op_name = config.name.unwrap_or_else(|| method_ident.to_string());
        let weight = config.weight;
        let wrapper_name = format_ident!("__isoload_op_{}_{}", owner, method_ident);

        wrappers.push(quote! {
            #[doc(hidden)]
            #[allow(non_snake_case, unused_mut)]
            fn #wrapper_name() -> ::core::result::Result<::isoload::Spec, ::isoload::OperationError> {
                let mut instance: #self_ty = ::core::default::Default::default();
                ::isoload::internal::IntoSpecResult::into_spec_result(instance.#method_ident())
                    .map_err(|e| ::isoload::OperationError::failed(#op_name, e))
            }
        });

        registrations.push(quote! {
            ::isoload::internal::inventory::submit! {
                ::isoload::OperationDef {
                    name: #op_name,
                    owner: #owner_str,
                    load_task: true,
                    weight: #weight,
                    run_fn: #wrapper_name,
                    file: file!(),
                    line: line!(),
                    module_path: module_path!(),
                }
            }
        });

        operation_names.push(op_name);
    }

    if operation_names.is_empty() {
        return Err(syn::Error::new_spanned(
            &item.self_ty,
            "#[load_tasks] found no #[load_task] methods",
        ));
    }

    Ok(quote! {
        #item

        #(#wrappers)*

        #(#registrations)*

        impl ::isoload::TaskDefinition for #self_ty {
            const NAME: &'static str = #owner_str;
            const OPERATIONS: &'static [&'static str] = &[#(#operation_names),*];
        }
    })
}
