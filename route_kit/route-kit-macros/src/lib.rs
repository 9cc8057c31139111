extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::{format_ident, quote, quote_spanned};
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{
    parse_macro_input, Attribute, Error, Expr, ExprArray, ExprAssign, FnArg, ImplItem, ImplItemFn,
    ItemImpl, Lit, LitStr, Meta, Receiver, Result, Token, Type,
};

const VERBS: &[(&str, &str)] = &[
    ("get", "Get"),
    ("post", "Post"),
    ("put", "Put"),
    ("patch", "Patch"),
    ("delete", "Delete"),
    ("options", "Options"),
    ("head", "Head"),
    ("all", "All"),
];

const PARAM_KINDS: &[&str] = &[
    "req", "request", "res", "response", "body", "query", "param", "headers", "cookies", "session",
    "custom",
];

const VALIDATORS: &[(&str, &str)] = &[
    ("validate_body", "Body"),
    ("validate_query", "Query"),
    ("validate_params", "Params"),
];

/// Declares the methods of an `impl` block as routes of a controller.
///
/// The type must implement `route_kit::Controller`. The macro strips the
/// route attributes from the block, implements `route_kit::Declare` and
/// submits the declaration so the process-wide registry picks it up.
///
/// ```ignore
/// #[controller("/users")]
/// #[use_middleware(RequestCounter::default())]
/// #[catch]
/// impl Users {
///     #[get("/:id")]
///     async fn get(&self, #[param("id")] id: String) -> Value {
///         json!({ "id": id })
///     }
///
///     #[post]
///     #[validate_body(user_schema(), status = 422)]
///     fn create(&self, #[body] user: NewUser) -> Result<Json<User>, HttpError> {
///         self.store.insert(user)
///     }
/// }
/// ```
///
/// Impl attributes: `#[use_middleware(a, b)]`, `#[catch]`, `#[catch(handler)]`.
/// Method attributes: `#[get]`, `#[post]`, `#[put]`, `#[patch]`, `#[delete]`,
/// `#[options]`, `#[head]`, `#[all]` with an optional path or
/// `path = "...", middleware = [..]`; `#[use_middleware(..)]`;
/// `#[validate_body|validate_query|validate_params(schema, strip_unknown = bool, status = u16)]`.
/// Parameter attributes: `#[req]`, `#[res]`, `#[body]`, `#[query]`, `#[param]`,
/// `#[headers]`, `#[cookies]` (each but the first two with an optional name),
/// `#[session]` and `#[custom(extractor)]`. Parameters without one receive
/// `null`, which suits `Option<T>`.
#[proc_macro_attribute]
pub fn controller(args: TokenStream, input: TokenStream) -> TokenStream {
    let args = parse_macro_input!(args with Punctuated::<Expr, Token![,]>::parse_terminated);
    let item = parse_macro_input!(input as ItemImpl);
    expand(args, item)
        .unwrap_or_else(Error::into_compile_error)
        .into()
}

struct RouteArgs {
    path: TokenStream2,
    middleware: Vec<Expr>,
}

/// Parses `()`, `("/path")` or `(path = "/path", middleware = [a, b])`.
fn route_args(args: &Punctuated<Expr, Token![,]>, key: &str) -> Result<RouteArgs> {
    let mut path = quote!(::std::string::String::new());
    let mut middleware = Vec::new();
    for arg in args {
        match arg {
            Expr::Lit(lit) => path = string_literal(&lit.lit)?,
            Expr::Assign(ExprAssign { left, right, .. }) => match assigned_name(left)?.as_str() {
                name if name == key => path = quote!(::std::string::String::from(#right)),
                "middleware" => middleware.extend(expr_list(right)?),
                other => return Err(Error::new(left.span(), format!("unknown option `{}`", other))),
            },
            other => return Err(Error::new(other.span(), format!("expected a {} string", key))),
        }
    }
    Ok(RouteArgs { path, middleware })
}

fn string_literal(lit: &Lit) -> Result<TokenStream2> {
    match lit {
        Lit::Str(s) => Ok(quote!(::std::string::String::from(#s))),
        other => Err(Error::new(other.span(), "expected a string literal")),
    }
}

fn assigned_name(expr: &Expr) -> Result<String> {
    match expr {
        Expr::Path(path) if path.path.get_ident().is_some() => {
            Ok(path.path.segments[0].ident.to_string())
        }
        other => Err(Error::new(other.span(), "expected an option name")),
    }
}

fn expr_list(expr: &Expr) -> Result<Vec<Expr>> {
    match expr {
        Expr::Array(ExprArray { elems, .. }) => Ok(elems.iter().cloned().collect()),
        other => Err(Error::new(other.span(), "expected a list `[..]`")),
    }
}

fn attr_args(attr: &Attribute) -> Result<Punctuated<Expr, Token![,]>> {
    match &attr.meta {
        Meta::Path(_) => Ok(Punctuated::new()),
        Meta::List(list) => list.parse_args_with(Punctuated::<Expr, Token![,]>::parse_terminated),
        Meta::NameValue(nv) => Err(Error::new(nv.span(), "expected `#[name]` or `#[name(..)]`")),
    }
}

fn attr_name(attr: &Attribute) -> Option<String> {
    attr.path().get_ident().map(|ident| ident.to_string())
}

fn shared(expr: &Expr) -> TokenStream2 {
    quote_spanned!(expr.span()=> ::route_kit::middleware::shared(#expr))
}

fn expand(args: Punctuated<Expr, Token![,]>, mut item: ItemImpl) -> Result<TokenStream2> {
    if !item.generics.params.is_empty() {
        return Err(Error::new(item.generics.span(), "controllers cannot be generic"));
    }
    if let Some((_, path, _)) = &item.trait_ {
        return Err(Error::new(path.span(), "#[controller] goes on an inherent impl block"));
    }
    let self_ty = item.self_ty.clone();

    let controller = route_args(&args, "prefix")?;
    let prefix = controller.path;
    let controller_middleware = controller.middleware.iter().map(shared);

    let mut statements = vec![quote! {
        __declaration.controller(::route_kit::ControllerOptions {
            prefix: #prefix,
            middleware: ::std::vec![#(#controller_middleware),*],
        });
    }];

    let mut kept = Vec::new();
    for attr in item.attrs.drain(..) {
        match attr_name(&attr).as_deref() {
            Some("use_middleware") => {
                for middleware in attr_args(&attr)? {
                    statements.push(quote!(__declaration.use_middleware(#middleware);));
                }
            }
            Some("catch") => {
                let handler = match attr_args(&attr)?.first() {
                    Some(handler) => quote!(::std::option::Option::Some(::route_kit::error_handler(#handler))),
                    None => quote!(::std::option::Option::None),
                };
                statements.push(quote!(__declaration.catch(#handler)?;));
            }
            _ => kept.push(attr),
        }
    }
    item.attrs = kept;

    for impl_item in &mut item.items {
        if let ImplItem::Fn(method) = impl_item {
            if let Some(tokens) = declare_method(method)? {
                statements.push(tokens);
            }
        }
    }

    let declare_fn = format_ident!("__route_kit_declare");
    Ok(quote! {
        #item

        impl ::route_kit::Declare for #self_ty {
            fn declare(
                __declaration: &mut ::route_kit::Declaration<'_, Self>,
            ) -> ::route_kit::Result<()> {
                #(#statements)*
                ::std::result::Result::Ok(())
            }
        }

        const _: () = {
            fn #declare_fn(registry: &::route_kit::MetadataRegistry) -> ::route_kit::Result<()> {
                ::route_kit::declare::<#self_ty>(registry)
            }

            ::route_kit::inventory::submit! {
                ::route_kit::ControllerDeclaration::new(#declare_fn)
            }
        };
    })
}

/// Strips the route attributes of one method and returns its declaration, if routed.
fn declare_method(method: &mut ImplItemFn) -> Result<Option<TokenStream2>> {
    let mut routes = Vec::new();
    let mut middleware = Vec::new();
    let mut kept = Vec::new();
    for attr in method.attrs.drain(..) {
        let name = attr_name(&attr);
        if let Some((_, variant)) = VERBS.iter().find(|(verb, _)| name.as_deref() == Some(*verb)) {
            let args = route_args(&attr_args(&attr)?, "path")?;
            let variant = format_ident!("{}", variant);
            let path = args.path;
            let route_middleware = args.middleware.iter().map(shared);
            routes.push(quote! {
                __method.route(
                    ::route_kit::HttpMethod::#variant,
                    ::route_kit::RouteOptions {
                        path: #path,
                        middleware: ::std::vec![#(#route_middleware),*],
                    },
                );
            });
        } else if name.as_deref() == Some("use_middleware") {
            for expr in attr_args(&attr)? {
                middleware.push(quote!(__method.use_middleware(#expr);));
            }
        } else if let Some((_, section)) =
            VALIDATORS.iter().find(|(v, _)| name.as_deref() == Some(*v))
        {
            middleware.push(validation(&attr, section)?);
        } else {
            kept.push(attr);
        }
    }
    method.attrs = kept;

    let mut params = Vec::new();
    let mut bindings = Vec::new();
    let mut call_args = Vec::new();
    let mut receiver = None;
    let mut index = 0usize;
    for input in method.sig.inputs.iter_mut() {
        let pat_type = match input {
            FnArg::Receiver(r) => {
                receiver = Some(r.clone());
                continue;
            }
            FnArg::Typed(pat_type) => pat_type,
        };

        let mut kind = None;
        let mut kept = Vec::new();
        for attr in pat_type.attrs.drain(..) {
            match attr_name(&attr) {
                Some(name) if PARAM_KINDS.contains(&name.as_str()) => {
                    if kind.is_some() {
                        return Err(Error::new(attr.span(), "a parameter takes one kind attribute"));
                    }
                    kind = Some((name, attr));
                }
                _ => kept.push(attr),
            }
        }
        pat_type.attrs = kept;

        let ty = &pat_type.ty;
        let binding = format_ident!("__arg{}", index);
        let value = match &kind {
            Some((name, _)) if name == "req" || name == "request" => quote!(__args.request(#index)?),
            Some((name, _)) if name == "res" || name == "response" => quote!(__args.response(#index)?),
            _ => quote!(__args.extract(#index)?),
        };
        bindings.push(quote!(let #binding: #ty = #value;));
        call_args.push(binding);
        if let Some((name, attr)) = kind {
            let kind = param_kind(&name, &attr)?;
            params.push(quote!(__method.param(#index, #kind);));
        }
        index += 1;
    }

    if routes.is_empty() {
        return Ok(None);
    }
    let receiver = receiver.as_ref().map(borrows_self).transpose()?;

    let ident = &method.sig.ident;
    let name = LitStr::new(&ident.to_string(), ident.span());
    let call = match receiver {
        Some(true) => quote!(<Self>::#ident(&__this, #(#call_args),*)),
        Some(false) => quote!(<Self>::#ident(__this, #(#call_args),*)),
        None => quote!(<Self>::#ident(#(#call_args),*)),
    };
    let call = match method.sig.asyncness {
        Some(_) => quote!(#call.await),
        None => call,
    };
    let this = match receiver {
        Some(_) => quote!(__this),
        None => quote!(_),
    };

    Ok(Some(quote! {
        {
            let mut __method = __declaration.method(
                #name,
                |#this: ::std::sync::Arc<Self>, __args: ::route_kit::Args| async move {
                    #[allow(unused_mut, unused_variables)]
                    let mut __args = __args;
                    #(#bindings)*
                    let __out = #call;
                    ::std::result::Result::<_, ::route_kit::HttpError>::Ok(__out)
                },
            );
            #(#routes)*
            #(#params)*
            #(#middleware)*
        }
    }))
}

/// `true` for `&self`, `false` for `self: Arc<Self>`. Instances are shared
/// across requests, so no other receiver can be served.
fn borrows_self(receiver: &Receiver) -> Result<bool> {
    if receiver.colon_token.is_none() {
        if receiver.reference.is_some() && receiver.mutability.is_none() {
            return Ok(true);
        }
    } else {
        match &*receiver.ty {
            Type::Reference(r) if r.mutability.is_none() => return Ok(true),
            Type::Path(p) if p.qself.is_none() && p.path.segments.last().is_some_and(|s| s.ident == "Arc") => {
                return Ok(false)
            }
            _ => {}
        }
    }
    Err(Error::new(receiver.span(), "controller methods take `&self` or `self: Arc<Self>`"))
}

fn param_kind(name: &str, attr: &Attribute) -> Result<TokenStream2> {
    let args = attr_args(attr)?;
    let field = match args.first() {
        Some(Expr::Lit(lit)) => match &lit.lit {
            Lit::Str(s) => quote!(::std::option::Option::Some(#s)),
            other => return Err(Error::new(other.span(), "expected a name string")),
        },
        Some(other) if name != "custom" => {
            return Err(Error::new(other.span(), "expected a name string"))
        }
        _ => quote!(::std::option::Option::None),
    };
    let tokens = match name {
        "req" | "request" => quote!(::route_kit::ParamKind::Request),
        "res" | "response" => quote!(::route_kit::ParamKind::Response),
        "body" => quote!(::route_kit::ParamKind::body(#field)),
        "query" => quote!(::route_kit::ParamKind::query(#field)),
        "param" => quote!(::route_kit::ParamKind::param(#field)),
        "headers" => quote!(::route_kit::ParamKind::headers(#field)),
        "cookies" => quote!(::route_kit::ParamKind::cookies(#field)),
        "session" => quote!(::route_kit::ParamKind::Session),
        "custom" => match args.first() {
            Some(extractor) => quote!(::route_kit::ParamKind::custom(#extractor)),
            None => return Err(Error::new(attr.span(), "#[custom] needs an extractor")),
        },
        other => quote!(::route_kit::ParamKind::parse(#other, #field)),
    };
    Ok(tokens)
}

fn validation(attr: &Attribute, section: &str) -> Result<TokenStream2> {
    let args = attr_args(attr)?;
    let mut iter = args.iter();
    let schema = iter
        .next()
        .ok_or_else(|| Error::new(attr.span(), "expected a schema"))?;
    let mut strip_unknown = quote!(true);
    let mut status = 400u16;
    for option in iter {
        let Expr::Assign(ExprAssign { left, right, .. }) = option else {
            return Err(Error::new(option.span(), "expected `strip_unknown = ..` or `status = ..`"));
        };
        match assigned_name(left)?.as_str() {
            "strip_unknown" => strip_unknown = quote!(#right),
            "status" => status = status_literal(right)?,
            other => return Err(Error::new(left.span(), format!("unknown option `{}`", other))),
        }
    }
    let section = format_ident!("{}", section);
    let span = Span::call_site();
    Ok(quote_spanned! {span=>
        __method.validate(
            ::route_kit::Section::#section,
            #schema,
            ::route_kit::ValidationOptions {
                strip_unknown: #strip_unknown,
                error_status: ::route_kit::axum::http::StatusCode::from_u16(#status)
                    .unwrap_or(::route_kit::axum::http::StatusCode::BAD_REQUEST),
            },
        );
    })
}

fn status_literal(expr: &Expr) -> Result<u16> {
    if let Expr::Lit(lit) = expr {
        if let Lit::Int(int) = &lit.lit {
            let status: u16 = int.base10_parse()?;
            if (100..=999).contains(&status) {
                return Ok(status);
            }
        }
    }
    Err(Error::new(expr.span(), "expected an HTTP status code"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    fn expand_impl(item: ItemImpl) -> Result<TokenStream2> {
        expand(Punctuated::new(), item)
    }

    #[test]
    fn shared_receivers_are_accepted() {
        assert!(expand_impl(parse_quote! {
            impl Users {
                #[get]
                fn list(&self) {}

                #[get("/:id")]
                async fn show(self: Arc<Self>) {}

                #[post]
                fn create(self: &Self) {}
            }
        })
        .is_ok());
    }

    #[test]
    fn owning_or_mutable_receivers_are_rejected() {
        let receivers: [ItemImpl; 4] = [
            parse_quote!(impl Users { #[get] fn list(self) {} }),
            parse_quote!(impl Users { #[get] fn list(mut self) {} }),
            parse_quote!(impl Users { #[get] fn list(&mut self) {} }),
            parse_quote!(impl Users { #[get] fn list(self: Box<Self>) {} }),
        ];
        for item in receivers {
            let err = expand_impl(item).unwrap_err();
            assert!(err.to_string().contains("`&self` or `self: Arc<Self>`"));
        }
    }

    #[test]
    fn unrouted_methods_keep_any_receiver() {
        assert!(expand_impl(parse_quote! {
            impl Users {
                fn reset(&mut self) {}
            }
        })
        .is_ok());
    }
}
