use std::net::TcpListener;
use std::time::Duration;

use async_h1_conn::server::{Responder, ServerOptions};
use async_h1_conn::TcpTransport;
use async_io::Async;
use http_types::{Request, Response, StatusCode};

async fn handle(req: Request, res: Responder) -> http_types::Result<()> {
    match req.url().path() {
        "/stream" => {
            let mut stream = res.stream(Response::new(StatusCode::Ok)).await?;
            for i in 0..5 {
                stream.write(format!("tick {}\n", i)).await?;
                async_io::Timer::after(Duration::from_millis(200)).await;
            }
            stream.end().await
        }
        _ => {
            let mut response = Response::new(StatusCode::Ok);
            response.set_body("hello chashu");
            res.respond(response).await
        }
    }
}

fn main() -> std::io::Result<()> {
    let opts = ServerOptions::new()
        .with_keep_alive_timeout(Some(Duration::from_secs(10)))
        .with_response_timeout(Some(Duration::from_secs(30)));

    async_global_executor::block_on(async {
        let listener = Async::<TcpListener>::bind(([127, 0, 0, 1], 8080))?;
        println!("listening on {}", listener.get_ref().local_addr()?);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TcpTransport::new(stream);
            async_global_executor::spawn(async_h1_conn::accept_with_opts(io, handle, opts.clone()))
                .detach();
        }
    })
}
