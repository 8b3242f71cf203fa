//! Length-prefixed binary framing shared by the worker server and the
//! submission client: one kind byte, a 4-byte big-endian length, body.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{FabricMeshError, Result};

/// Any length prefix above this aborts the connection.
pub const MAX_FRAME_BYTES: u32 = 100 * 1024 * 1024;

pub async fn read_u32<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

pub async fn read_kind<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf).await?;
    Ok(buf[0])
}

/// Read a length-prefixed body, rejecting oversize frames.
pub async fn read_body<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = read_u32(reader).await?;
    if len > MAX_FRAME_BYTES {
        return Err(FabricMeshError::OversizeFrame { len: len as u64 });
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

pub async fn write_kind<W: AsyncWriteExt + Unpin>(writer: &mut W, kind: u8) -> Result<()> {
    writer.write_all(&[kind]).await?;
    Ok(())
}

pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    kind: u8,
    body: &[u8],
) -> Result<()> {
    writer.write_all(&[kind]).await?;
    write_frame_body(writer, body).await
}

/// Write a length-prefixed body with no leading kind byte, for
/// responses whose kind is a plain status byte written separately.
pub async fn write_frame_body<W: AsyncWriteExt + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_frame(&mut client, b'O', b"hello").await.unwrap();
        drop(client);

        let kind = read_kind(&mut server).await.unwrap();
        assert_eq!(kind, b'O');
        let body = read_body(&mut server).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn oversize_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(16);
        let oversize = MAX_FRAME_BYTES + 1;
        client.write_all(&oversize.to_be_bytes()).await.unwrap();
        drop(client);

        let err = read_body(&mut server).await.unwrap_err();
        assert!(matches!(err, FabricMeshError::OversizeFrame { .. }));
    }

    #[tokio::test]
    async fn empty_body_roundtrips() {
        let (mut client, mut server) = tokio::io::duplex(16);
        write_frame(&mut client, b'R', b"").await.unwrap();
        drop(client);

        read_kind(&mut server).await.unwrap();
        let body = read_body(&mut server).await.unwrap();
        assert!(body.is_empty());
    }

    proptest::proptest! {
        #[test]
        fn frame_roundtrip_preserves_arbitrary_bytes(body in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..8192)) {
            let body_clone = body.clone();
            let result: Result<()> = tokio_test_roundtrip(body_clone);
            proptest::prop_assert!(result.is_ok());
        }
    }

    fn tokio_test_roundtrip(body: Vec<u8>) -> Result<()> {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(async move {
                let (mut client, mut server) = tokio::io::duplex(1 << 20);
                write_frame(&mut client, b'O', &body).await?;
                drop(client);
                read_kind(&mut server).await?;
                let read_back = read_body(&mut server).await?;
                if read_back != body {
                    return Err(FabricMeshError::MalformedFrame {
                        reason: "roundtrip mismatch".to_string(),
                    });
                }
                Ok(())
            })
    }
}
