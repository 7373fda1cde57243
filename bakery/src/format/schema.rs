/// Identifier of a macaroon minted by an [`Oven`](crate::Oven), encoded
/// after a version byte
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MacaroonId {
    #[prost(bytes="vec", tag="1")]
    pub nonce: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes="vec", tag="2")]
    pub storage_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, repeated, tag="3")]
    pub ops: ::prost::alloc::vec::Vec<Op>,
}
/// All the actions allowed on one entity
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Op {
    #[prost(string, tag="1")]
    pub entity: ::prost::alloc::string::String,
    #[prost(string, repeated, tag="2")]
    pub actions: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}
