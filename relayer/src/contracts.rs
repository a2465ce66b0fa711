use alloy::sol;

sol! {
    /// The gateway contract deployed on every bridged chain. Emits requests on the source side and checks
    /// signer quorum before processing a message.
    #[sol(rpc)]
    interface IMessageGateway {
        event MessageRequest(uint256 txId, uint256 destChainId, bytes data);

        function isMessageValid(bytes calldata data, address[] calldata signers, bytes[] calldata signatures) external view returns (bool valid);

        function messageProcess(uint256 feeAmount, bytes calldata message, address[] calldata signers, bytes[] calldata signatures) external;
    }
}
