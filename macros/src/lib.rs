mod service;

use proc_macro::TokenStream;
use quote::ToTokens;
use service::{Service, ServiceArgs};
use syn::{parse_macro_input, ItemTrait};

/// Attribute macro placed on a trait to define a remote service.
///
/// Every method must be `async`, take `&self`, and take owned, serializable arguments. A method
/// returning `Result<T, E>` with `E: Display` sends `T` back on success and the rendered error
/// on failure; any other return type is sent back as is.
///
/// The trait is rewritten so that each method returns a `Send` future, and two types are
/// generated next to it:
///
/// - `<Trait>Client`, a stub whose methods call the remote service and wait for the result.
/// - `<Trait>Server<T>`, which exports any implementation of the trait on an `RpcServer`.
///
/// The service is exported under the trait's name unless `name = "..."` is given.
///
/// # Example
///
/// ```ignore
/// use courier::service;
///
/// #[service]
/// pub trait HelloService {
///     /// Greets someone by name.
///     async fn hello(&self, name: String) -> String;
///
///     async fn hello_user(&self, user: User) -> Result<String, HelloError>;
/// }
///
/// struct HelloServiceImpl;
///
/// impl HelloService for HelloServiceImpl {
///     async fn hello(&self, name: String) -> String {
///         format!("hello! {name}")
///     }
///
///     async fn hello_user(&self, user: User) -> Result<String, HelloError> {
///         Ok(format!("hello! {}", user.name))
///     }
/// }
///
/// server.register(HelloServiceServer::new(HelloServiceImpl));
///
/// let hello = HelloServiceClient::new(&client);
/// assert_eq!(hello.hello("zhang3".to_string()).await?, "hello! zhang3");
/// ```
///
/// <details>
/// <summary>See expanded code</summary>
///
/// ```ignore
/// pub trait HelloService: Send + Sync + 'static {
///     fn hello(&self, name: String) -> impl Future<Output = String> + Send;
///     fn hello_user(&self, user: User) -> impl Future<Output = Result<String, HelloError>> + Send;
/// }
///
/// #[derive(Clone, Debug)]
/// pub struct HelloServiceClient {
///     client: courier::client::ServiceClient,
/// }
///
/// impl HelloServiceClient {
///     pub const SERVICE_NAME: &'static str = "HelloService";
///
///     pub async fn hello(&self, name: String) -> Result<String, courier::error::RpcError> {
///         self.client
///             .invoke::<String>(
///                 "hello",
///                 vec![type_descriptor::<String>()],
///                 vec![Encode::encode(&name)?],
///             )
///             .await
///     }
///
///     // ...
/// }
///
/// pub struct HelloServiceServer<T> {
///     table: courier::server::MethodTable,
///     _service: PhantomData<fn() -> T>,
/// }
///
/// impl<T: HelloService> courier::server::Service for HelloServiceServer<T> {
///     // delegates to a method table keyed by `hello@string` and `hello_user@User`
/// }
/// ```
/// </details>
#[proc_macro_attribute]
pub fn service(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as ServiceArgs);
    let item_trait = parse_macro_input!(item as ItemTrait);
    TokenStream::from(Service::new(args, item_trait).into_token_stream())
}
