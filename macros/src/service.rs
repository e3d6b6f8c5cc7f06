use proc_macro2::TokenStream;
use quote::{format_ident, quote, ToTokens};
use syn::{
    parse::{Parse, ParseStream},
    parse_quote,
    spanned::Spanned,
    Attribute, FnArg, GenericArgument, Ident, ItemTrait, LitStr, Meta, Pat, PathArguments,
    ReturnType, Token, TraitItem, Type,
};

/// Arguments of the `#[service]` attribute.
#[derive(Default)]
pub struct ServiceArgs {
    name: Option<LitStr>,
}

impl Parse for ServiceArgs {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        let mut args = ServiceArgs::default();
        while !input.is_empty() {
            let key: Ident = input.parse()?;
            input.parse::<Token![=]>()?;
            if key == "name" {
                args.name = Some(input.parse()?);
            } else {
                return Err(syn::Error::new(
                    key.span(),
                    format!("unknown service argument `{key}`, expected `name`"),
                ));
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }
        Ok(args)
    }
}

pub struct Service {
    item_trait: ItemTrait,
    name: LitStr,
    methods: Vec<Method>,
    errors: Option<syn::Error>,
}

struct Method {
    ident: Ident,
    docs: Vec<Attribute>,
    params: Vec<(Ident, Type)>,
    output: Output,
}

enum Output {
    /// The method returns its value directly.
    Plain(Type),
    /// The method returns `Result<T, E>`; only `T` is sent back on success.
    Fallible(Type),
}

impl Output {
    fn ok_ty(&self) -> &Type {
        match self {
            Output::Plain(ty) | Output::Fallible(ty) => ty,
        }
    }
}

impl Service {
    pub fn new(args: ServiceArgs, mut item_trait: ItemTrait) -> Self {
        let name = args
            .name
            .unwrap_or_else(|| LitStr::new(&item_trait.ident.to_string(), item_trait.ident.span()));
        let mut errors: Vec<syn::Error> = Vec::new();

        if !item_trait.generics.params.is_empty() {
            errors.push(syn::Error::new(
                item_trait.generics.span(),
                "service traits cannot be generic",
            ));
        }

        let methods = item_trait
            .items
            .iter_mut()
            .filter_map(|item| match item {
                TraitItem::Fn(item_fn) => match Method::extract(item_fn) {
                    Ok(method) => Some(method),
                    Err(err) => {
                        errors.push(err);
                        None
                    }
                },
                other => {
                    errors.push(syn::Error::new(
                        other.span(),
                        "service traits may only contain methods",
                    ));
                    None
                }
            })
            .collect();

        item_trait.supertraits.push(parse_quote!(::std::marker::Send));
        item_trait.supertraits.push(parse_quote!(::std::marker::Sync));
        item_trait.supertraits.push(parse_quote!('static));

        let errors = errors.into_iter().reduce(|mut acc, err| {
            acc.combine(err);
            acc
        });

        Service {
            item_trait,
            name,
            methods,
            errors,
        }
    }

    fn expand_client(&self) -> TokenStream {
        let vis = &self.item_trait.vis;
        let trait_ident = &self.item_trait.ident;
        let client_ident = format_ident!("{}Client", trait_ident);
        let name = &self.name;
        let doc = format!("Client stub calling a remote [`{trait_ident}`].");

        let methods = self.methods.iter().map(|method| {
            let Method {
                ident,
                docs,
                params,
                output,
            } = method;
            let method_name = ident.to_string();
            let ok_ty = output.ok_ty();
            let param_tys = params.iter().map(|(_, ty)| ty);
            let args = params.iter().map(|(ident, ty)| quote! { #ident: #ty });
            let encoded = params
                .iter()
                .map(|(ident, _)| quote! { ::courier::codec::Encode::encode(&#ident)? });

            quote! {
                #( #docs )*
                pub async fn #ident(
                    &self,
                    #( #args ),*
                ) -> ::std::result::Result<#ok_ty, ::courier::error::RpcError> {
                    self.client
                        .invoke::<#ok_ty>(
                            #method_name,
                            ::std::vec![#( ::courier::codec::type_descriptor::<#param_tys>() ),*],
                            ::std::vec![#( #encoded ),*],
                        )
                        .await
                }
            }
        });

        quote! {
            #[doc = #doc]
            #[derive(Clone, Debug)]
            #vis struct #client_ident {
                client: ::courier::client::ServiceClient,
            }

            impl #client_ident {
                /// The name this service is exported under.
                pub const SERVICE_NAME: &'static str = #name;

                /// Creates a stub calling through `client`.
                pub fn new(client: &::courier::client::RpcClient) -> Self {
                    #client_ident {
                        client: client.service(Self::SERVICE_NAME),
                    }
                }

                /// Overrides the call timeout.
                pub fn with_timeout(mut self, timeout: ::std::time::Duration) -> Self {
                    self.client = self.client.with_timeout(timeout);
                    self
                }

                #( #methods )*
            }
        }
    }

    fn expand_server(&self) -> TokenStream {
        let vis = &self.item_trait.vis;
        let trait_ident = &self.item_trait.ident;
        let server_ident = format_ident!("{}Server", trait_ident);
        let name = &self.name;
        let doc = format!("Exports an implementation of [`{trait_ident}`] as a service.");

        let methods = self.methods.iter().map(|method| {
            let Method {
                ident,
                params,
                output,
                ..
            } = method;
            let method_name = ident.to_string();
            let param_idents: Vec<_> = params.iter().map(|(ident, _)| ident).collect();
            let param_tys = params.iter().map(|(_, ty)| ty);
            let call = quote! { service.#ident(#( #param_idents ),*).await };
            let body = match output {
                Output::Plain(_) => quote! {
                    ::std::result::Result::Ok::<_, ::courier::error::ServiceError>(#call)
                },
                Output::Fallible(_) => quote! {
                    #call.map_err(::courier::error::ServiceError::handler)
                },
            };

            quote! {
                .method(#method_name, {
                    let service = service.clone();
                    move |(#( #param_idents, )*): (#( #param_tys, )*)| {
                        let service = service.clone();
                        async move { #body }
                    }
                })
            }
        });

        quote! {
            #[doc = #doc]
            #vis struct #server_ident<T> {
                table: ::courier::server::MethodTable,
                _service: ::std::marker::PhantomData<fn() -> T>,
            }

            impl<T: #trait_ident> #server_ident<T> {
                /// Wraps `service` for registration on a server.
                pub fn new(service: T) -> Self {
                    Self::from_arc(::std::sync::Arc::new(service))
                }

                /// Wraps a shared `service` for registration on a server.
                pub fn from_arc(service: ::std::sync::Arc<T>) -> Self {
                    let table = ::courier::server::MethodTable::new(#name)
                        #( #methods )*;
                    #server_ident {
                        table,
                        _service: ::std::marker::PhantomData,
                    }
                }
            }

            impl<T: #trait_ident> ::courier::server::Service for #server_ident<T> {
                fn name(&self) -> &str {
                    ::courier::server::Service::name(&self.table)
                }

                fn methods(&self) -> ::std::vec::Vec<::std::string::String> {
                    ::courier::server::Service::methods(&self.table)
                }

                fn call(
                    &self,
                    method: &str,
                    param_types: &[::std::string::String],
                    params: ::std::vec::Vec<::courier::bytes::Bytes>,
                ) -> ::courier::server::BoxFuture<
                    'static,
                    ::std::result::Result<::courier::bytes::Bytes, ::courier::error::ServiceError>,
                > {
                    ::courier::server::Service::call(&self.table, method, param_types, params)
                }
            }

            impl<T> ::std::fmt::Debug for #server_ident<T> {
                fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                    ::std::fmt::Debug::fmt(&self.table, f)
                }
            }
        }
    }
}

impl ToTokens for Service {
    fn to_tokens(&self, tokens: &mut TokenStream) {
        let item_trait = &self.item_trait;
        let client = self.expand_client();
        let server = self.expand_server();
        let errors = self.errors.as_ref().map(syn::Error::to_compile_error);

        tokens.extend(quote! {
            #item_trait
            #client
            #server
            #errors
        });
    }
}

impl Method {
    /// Validates a trait method and rewrites its signature to return a `Send` future.
    fn extract(item_fn: &mut syn::TraitItemFn) -> syn::Result<Self> {
        let sig = &mut item_fn.sig;
        if sig.asyncness.is_none() {
            return Err(syn::Error::new(
                sig.fn_token.span(),
                "service methods must be async",
            ));
        }
        if item_fn.default.is_some() {
            return Err(syn::Error::new(
                sig.span(),
                "service methods cannot have a default body",
            ));
        }
        if !sig.generics.params.is_empty() {
            return Err(syn::Error::new(
                sig.generics.span(),
                "service methods cannot be generic",
            ));
        }

        match sig.inputs.first() {
            Some(FnArg::Receiver(receiver))
                if receiver.reference.is_some() && receiver.mutability.is_none() => {}
            _ => {
                return Err(syn::Error::new(
                    sig.span(),
                    "service methods must take &self",
                ))
            }
        }

        let params = sig
            .inputs
            .iter()
            .skip(1)
            .map(|input| match input {
                FnArg::Typed(pat_type) => {
                    let ident = match pat_type.pat.as_ref() {
                        Pat::Ident(pat_ident) => pat_ident.ident.clone(),
                        _ => {
                            return Err(syn::Error::new(
                                pat_type.pat.span(),
                                "unsupported pattern - arguments must be named in service methods",
                            ))
                        }
                    };
                    if let Type::Reference(reference) = pat_type.ty.as_ref() {
                        return Err(syn::Error::new(
                            reference.span(),
                            "service method arguments must be owned types",
                        ));
                    }
                    Ok((ident, (*pat_type.ty).clone()))
                }
                FnArg::Receiver(receiver) => Err(syn::Error::new(
                    receiver.span(),
                    "unexpected receiver",
                )),
            })
            .collect::<syn::Result<Vec<_>>>()?;

        let ret: Type = match &sig.output {
            ReturnType::Default => parse_quote!(()),
            ReturnType::Type(_, ty) => (**ty).clone(),
        };
        let output = match result_ok_type(&ret) {
            Some(ok) => Output::Fallible(ok),
            None => Output::Plain(ret.clone()),
        };

        sig.asyncness = None;
        sig.output = parse_quote! {
            -> impl ::std::future::Future<Output = #ret> + ::std::marker::Send
        };

        let docs = item_fn
            .attrs
            .iter()
            .filter(|attr| matches!(&attr.meta, Meta::NameValue(meta) if meta.path.is_ident("doc")))
            .cloned()
            .collect();

        Ok(Method {
            ident: sig.ident.clone(),
            docs,
            params,
            output,
        })
    }
}

/// Returns `T` if `ty` is written as `Result<T, E>`.
fn result_ok_type(ty: &Type) -> Option<Type> {
    let Type::Path(type_path) = ty else {
        return None;
    };
    let segment = type_path.path.segments.last()?;
    if segment.ident != "Result" {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    if args.args.len() != 2 {
        return None;
    }
    match args.args.first()? {
        GenericArgument::Type(ok) => Some(ok.clone()),
        _ => None,
    }
}
